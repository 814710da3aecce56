//! Object-store level entities: object identifiers, headers, attributes and
//! search filters.

use serde::{Deserialize, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Length in bytes of an object identifier.
pub const OBJECT_ID_LEN: usize = 32;

/// A content-addressed object identifier.
///
/// The all-zero value never names a real object; index files use it to mark
/// an unfilled slot.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0u8; OBJECT_ID_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; OBJECT_ID_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Build an identifier from exactly [`OBJECT_ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; OBJECT_ID_LEN];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A single key/value attribute attached to an object header.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

/// Everything the store knows about an object except its payload.
#[derive(Serialize, Clone, Debug)]
pub struct ObjectHeader {
    /// Container the object lives in.
    pub container: String,

    /// Owner recorded at upload time.
    pub owner: String,

    /// User attributes, in upload order.
    pub attributes: Vec<Attribute>,

    /// Payload length in bytes. Zero for streaming puts until the store
    /// finalises the object.
    pub payload_size: u64,

    /// SHA-256 of the payload, hex encoded. Filled by the store for
    /// streaming puts.
    pub checksum: Option<String>,

    /// Tillich–Zémor checksum of the payload, hex encoded.
    pub homomorphic_checksum: Option<String>,
}

impl ObjectHeader {
    pub fn new(container: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            owner: owner.into(),
            attributes: Vec::new(),
            payload_size: 0,
            checksum: None,
            homomorphic_checksum: None,
        }
    }

    /// Value of the first attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }

    /// Numeric value of the attribute named `key`, if present and parseable.
    pub fn numeric_attribute(&self, key: &str) -> Option<u64> {
        self.attribute(key).and_then(|v| v.parse().ok())
    }
}

/// Comparison applied by a search filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    GreaterOrEqual,
    LessThan,
}

/// One predicate of a search request. Numeric comparisons are used whenever
/// both sides parse as unsigned integers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchFilter {
    pub key: String,
    pub op: MatchType,
    pub value: String,
}

impl SearchFilter {
    pub fn equal(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            op: MatchType::Equal,
            value: value.to_string(),
        }
    }

    pub fn greater_or_equal(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            op: MatchType::GreaterOrEqual,
            value: value.to_string(),
        }
    }

    pub fn less_than(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            op: MatchType::LessThan,
            value: value.to_string(),
        }
    }
}

/// A search request: all filters must match. `attributes` names the
/// attribute values to return alongside each identifier.
#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    pub filters: Vec<SearchFilter>,
    pub attributes: Vec<String>,
    pub cursor: Option<String>,
}

/// A single search hit. `attributes[i]` holds the value of the i-th
/// requested attribute, empty when the object lacks it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchItem {
    pub id: ObjectId,
    pub attributes: Vec<String>,
}

/// One page of search results. `cursor` is `None` on the last page.
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::filter_matches;

    #[test]
    fn object_id_parses_its_display_form() {
        let mut raw = [0u8; OBJECT_ID_LEN];
        raw[0] = 0xab;
        raw[31] = 0x01;
        let id = ObjectId(raw);
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(!id.is_zero());
        assert!(ObjectId::ZERO.is_zero());
    }

    #[test]
    fn numeric_filters_compare_as_numbers() {
        assert!(filter_matches(&SearchFilter::greater_or_equal("Block", 9), "10"));
        assert!(filter_matches(&SearchFilter::less_than("Block", 10), "9"));
        assert!(!filter_matches(&SearchFilter::less_than("Block", 10), "10"));
        assert!(filter_matches(&SearchFilter::equal("Block", 7), "7"));
        assert!(filter_matches(&SearchFilter::equal("Magic", "main"), "main"));
    }

    #[test]
    fn header_attribute_lookup() {
        let mut header = ObjectHeader::new("c", "owner");
        header.attributes.push(Attribute::new("Block", 42));
        assert_eq!(header.numeric_attribute("Block"), Some(42));
        assert_eq!(header.attribute("Hash"), None);
    }
}
