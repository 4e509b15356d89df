//! `serde` support for [`WordMap`].

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

use std::fmt;
use std::marker::PhantomData;

use crate::guard::Guard;
use crate::map::WordMap;

impl<V, G> Serialize for WordMap<V, G>
where
    V: Serialize + Clone + Send + Sync + 'static,
    G: Guard,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(&key, &value)?;
        }
        map.end()
    }
}

struct WordMapVisitor<V, G: Guard> {
    marker: PhantomData<fn() -> WordMap<V, G>>,
}

impl<'d, V, G> Visitor<'d> for WordMapVisitor<V, G>
where
    V: Deserialize<'d> + Send + Sync + 'static,
    G: Guard,
{
    type Value = WordMap<V, G>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map with integer keys")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'d>,
    {
        let map = WordMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<usize, V>()? {
            map.set(key, value);
        }
        Ok(map)
    }
}

impl<'d, V, G> Deserialize<'d> for WordMap<V, G>
where
    V: Deserialize<'d> + Send + Sync + 'static,
    G: Guard,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        deserializer.deserialize_map(WordMapVisitor {
            marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::guard::DeferredGuard;
    use crate::map::WordMap;

    #[test]
    fn test_serde_round_trip() {
        let map: WordMap<String, DeferredGuard> = WordMap::new();
        map.set(3, "three".to_string());
        map.set(1, "one".to_string());
        map.set(2, "two".to_string());

        let json = serde_json::to_string(&map).unwrap();
        // Ascending key order falls out of the sorted list.
        assert_eq!(json, r#"{"1":"one","2":"two","3":"three"}"#);

        let restored: WordMap<String, DeferredGuard> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.get(2).as_deref(), Some(&"two".to_string()));
    }
}
