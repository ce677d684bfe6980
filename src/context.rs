use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type Value = Arc<dyn Any + Send + Sync>;

/// String-keyed session storage attached to every connection.
///
/// The map is allocated lazily on first `set`. Values are shared
/// (`Arc<dyn Any>`), so `get` hands back ownership without cloning the
/// underlying data.
#[derive(Default)]
pub struct KeyValueContext {
    kv: RwLock<Option<HashMap<String, Value>>>,
}

impl KeyValueContext {
    pub fn set(&self, key: &str, value: Value) {
        let mut kv = self.kv.write().unwrap();
        kv.get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let kv = self.kv.read().unwrap();
        kv.as_ref().and_then(|kv| kv.get(key).cloned())
    }

    pub fn delete(&self, key: &str) {
        let mut kv = self.kv.write().unwrap();
        if let Some(kv) = kv.as_mut() {
            kv.remove(key);
        }
    }

    pub(crate) fn reset(&self) {
        *self.kv.write().unwrap() = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_delete() {
        let ctx = KeyValueContext::default();

        assert!(ctx.get("user").is_none());

        ctx.set("user", Arc::new("alice".to_string()));
        let value = ctx.get("user").unwrap();
        assert_eq!(
            value.downcast_ref::<String>().map(String::as_str),
            Some("alice")
        );

        ctx.set("user", Arc::new("bob".to_string()));
        let value = ctx.get("user").unwrap();
        assert_eq!(
            value.downcast_ref::<String>().map(String::as_str),
            Some("bob")
        );

        ctx.delete("user");
        assert!(ctx.get("user").is_none());
    }

    #[test]
    fn delete_on_empty_map_is_a_no_op() {
        let ctx = KeyValueContext::default();
        ctx.delete("missing");
    }

    #[test]
    fn reset_clears_everything() {
        let ctx = KeyValueContext::default();
        ctx.set("a", Arc::new(1u32));
        ctx.set("b", Arc::new(2u32));
        ctx.reset();
        assert!(ctx.get("a").is_none());
        assert!(ctx.get("b").is_none());
    }
}
