//! Store key layout: `<region>/<type-tag>/<key>`.
//!
//! The type tag is zero padded so that all keys of one type form a single
//! contiguous, independently scannable range.

use edgegrid_core::{ObjKey, StoredObject};

pub fn region_prefix(region: u32) -> String {
    format!("{region}/")
}

pub fn type_prefix(region: u32, tag: u16) -> String {
    format!("{region}/{tag:03}/")
}

pub fn db_key<T: StoredObject>(region: u32, key: &T::Key) -> String {
    format!("{}{}", type_prefix(region, T::TYPE_TAG), key.key_string())
}

/// Split a store key into region, type tag, and key id.
pub fn parse_db_key(key: &str) -> Option<(u32, u16, &str)> {
    let mut parts = key.splitn(3, '/');
    let region = parts.next()?.parse().ok()?;
    let tag = parts.next()?.parse().ok()?;
    let id = parts.next()?;
    Some((region, tag, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_core::{CloudletKey, ClusterInst, ClusterInstKey};

    #[test]
    fn layout_and_parse() {
        let key = ClusterInstKey::new("c1", CloudletKey::new("op", "edge/1"), "dev");
        let db = db_key::<ClusterInst>(2, &key);
        assert!(db.starts_with("2/040/"));

        let (region, tag, id) = parse_db_key(&db).unwrap();
        assert_eq!(region, 2);
        assert_eq!(tag, 40);
        assert_eq!(ClusterInstKey::from_key_string(id).unwrap(), key);
    }

    #[test]
    fn tags_sort_numerically() {
        assert!(type_prefix(1, 22) < type_prefix(1, 40));
        assert!(type_prefix(1, 40) < type_prefix(1, 100));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_db_key("nope").is_none());
        assert!(parse_db_key("1/x/abc").is_none());
    }
}
