//! Parameters handed to a node's execute callback.

use std::sync::Arc;

use crate::value::TypedValue;

/// Everything a kind's execute callback can see for one run of one node.
///
/// Inputs are materialized copies of the node's input slots, addressed by
/// socket identifier; an input that is optional and unfilled is `None`.
/// Outputs are writable slots the executor forwards downstream after the
/// callback returns. The node's own storage slot and the run-wide global
/// payload are also exposed here.
pub struct ExecParams {
    inputs: Vec<(String, Option<TypedValue>)>,
    outputs: Vec<(String, TypedValue)>,
    storage: TypedValue,
    global_payload: Arc<TypedValue>,
    error: Option<String>,
}

impl ExecParams {
    /// Assemble params from resolved slots. Used by executors.
    pub fn new(
        inputs: Vec<(String, Option<TypedValue>)>,
        outputs: Vec<(String, TypedValue)>,
        storage: TypedValue,
        global_payload: Arc<TypedValue>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            storage,
            global_payload,
            error: None,
        }
    }

    /// Borrow an input as `T`. `None` if the input is absent, unfilled, or
    /// holds a different type; callbacks should treat that as a failure.
    pub fn get_input<T: 'static>(&self, identifier: &str) -> Option<&T> {
        self.input_any(identifier).and_then(|v| v.downcast_ref())
    }

    /// All inputs in socket order. Unfilled optional inputs are `None`.
    ///
    /// Kinds with dynamic socket groups iterate this instead of addressing
    /// slots by name.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, Option<&TypedValue>)> {
        self.inputs.iter().map(|(id, v)| (id.as_str(), v.as_ref()))
    }

    /// Borrow an input as a typed value.
    pub fn input_any(&self, identifier: &str) -> Option<&TypedValue> {
        self.inputs
            .iter()
            .find(|(id, _)| id == identifier)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Write a typed output. Returns false when the output is missing or the
    /// slot's type disagrees with `T`.
    pub fn set_output<T: Send + Sync + 'static>(&mut self, identifier: &str, value: T) -> bool {
        let Some((_, slot)) = self.outputs.iter_mut().find(|(id, _)| id == identifier) else {
            return false;
        };
        let Some(ty) = slot.ty().cloned() else {
            return false;
        };
        match TypedValue::with(&ty, value) {
            Ok(v) => {
                *slot = v;
                true
            }
            Err(_) => false,
        }
    }

    /// Write an output slot wholesale. Used for polymorphic outputs.
    pub fn set_output_any(&mut self, identifier: &str, value: TypedValue) -> bool {
        let Some((_, slot)) = self.outputs.iter_mut().find(|(id, _)| id == identifier) else {
            return false;
        };
        *slot = value;
        true
    }

    /// Peek at an output slot.
    pub fn output_any(&self, identifier: &str) -> Option<&TypedValue> {
        self.outputs
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, v)| v)
    }

    /// The node's own storage slot.
    pub fn storage(&self) -> &TypedValue {
        &self.storage
    }

    /// Replace the node's storage slot.
    pub fn set_storage(&mut self, value: TypedValue) {
        self.storage = value;
    }

    /// Borrow the run-wide global payload as `T`.
    pub fn get_global_payload<T: 'static>(&self) -> Option<&T> {
        self.global_payload.downcast_ref()
    }

    /// Record a failure message more specific than the generic one.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Tear down into the pieces the executor writes back.
    pub fn into_parts(self) -> (Vec<(String, TypedValue)>, TypedValue, Option<String>) {
        (self.outputs, self.storage, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeRegistry;

    fn params(registry: &TypeRegistry) -> ExecParams {
        let int = registry.resolve::<i32>().unwrap();
        ExecParams::new(
            vec![
                ("a".to_string(), Some(registry.value_of(3i32).unwrap())),
                ("b".to_string(), None),
            ],
            vec![("result".to_string(), int.default_value())],
            TypedValue::empty(),
            Arc::new(registry.value_of(99i32).unwrap()),
        )
    }

    #[test]
    fn test_input_access() {
        let registry = TypeRegistry::with_standard_types();
        let p = params(&registry);

        assert_eq!(p.get_input::<i32>("a"), Some(&3));
        assert!(p.get_input::<f32>("a").is_none());
        assert!(p.get_input::<i32>("b").is_none());
        assert!(p.get_input::<i32>("missing").is_none());
    }

    #[test]
    fn test_output_write() {
        let registry = TypeRegistry::with_standard_types();
        let mut p = params(&registry);

        assert!(p.set_output("result", 42i32));
        assert!(!p.set_output("result", 1.0f32));
        assert!(!p.set_output("missing", 1i32));

        let (outputs, _, _) = p.into_parts();
        assert_eq!(outputs[0].1.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn test_global_payload() {
        let registry = TypeRegistry::with_standard_types();
        let p = params(&registry);
        assert_eq!(p.get_global_payload::<i32>(), Some(&99));
        assert!(p.get_global_payload::<f32>().is_none());
    }

    #[test]
    fn test_error_channel() {
        let registry = TypeRegistry::with_standard_types();
        let mut p = params(&registry);
        p.set_error("bad frame");
        let (_, _, error) = p.into_parts();
        assert_eq!(error.as_deref(), Some("bad frame"));
    }
}
