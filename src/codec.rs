//! Serde helpers for the persisted JSON shapes
//!
//! Byte fields are written as `"base64://<standard base64>"` strings and maps
//! as explicit ordered lists `["map://", [key, value], ...]`, so a reader never
//! has to rely on JSON object ordering or string-only keys.

/// `Vec<u8>` <-> `"base64://..."`
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const PREFIX: &str = "base64://";

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}{}", PREFIX, STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let encoded = text
            .strip_prefix(PREFIX)
            .ok_or_else(|| de::Error::custom(format!("byte field must start with {}", PREFIX)))?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

/// `BTreeMap<K, V>` <-> `["map://", [k, v], ...]`
pub mod ordered_map {
    use std::collections::BTreeMap;
    use std::fmt;
    use std::marker::PhantomData;

    use serde::de::{self, SeqAccess, Unexpected, Visitor};
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub const MARKER: &str = "map://";

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(map.len() + 1))?;
        seq.serialize_element(MARKER)?;
        for (key, value) in map {
            seq.serialize_element(&(key, value))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(OrderedMapVisitor(PhantomData))
    }

    struct OrderedMapVisitor<K, V>(PhantomData<(K, V)>);

    impl<'de, K, V> Visitor<'de> for OrderedMapVisitor<K, V>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        type Value = BTreeMap<K, V>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a \"map://\" tagged list of key/value pairs")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let marker: String = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(0, &self))?;
            if marker != MARKER {
                return Err(de::Error::invalid_value(Unexpected::Str(&marker), &self));
            }
            let mut map = BTreeMap::new();
            while let Some((key, value)) = seq.next_element::<(K, V)>()? {
                map.insert(key, value);
            }
            Ok(map)
        }
    }
}
