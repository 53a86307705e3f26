//! Content hashes of table descriptors.
//!
//! A fingerprint is a SHA-256 digest over a tagged, length-prefixed encoding
//! of the descriptor's canonical form. Columns, indices and foreign keys are
//! encoded in sorted order, so descriptors that differ only in construction
//! order hash identically.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::schema::{ColumnDescriptor, TableDescriptor};

/// Bumped whenever the encoding below changes.
const ENCODING_VERSION: u8 = 1;

/// Width of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Deterministic digest of a table descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Computes the fingerprint of a descriptor.
    #[must_use]
    pub fn of(table: &TableDescriptor) -> Self {
        let table = table.canonical();
        let mut enc = Encoder::new();
        enc.tag(b'V');
        enc.hasher.update([ENCODING_VERSION]);

        enc.tag(b'T');
        enc.str(&table.name);

        let primary_key = table.primary_key();
        enc.tag(b'K');
        enc.len(primary_key.len());
        for column in primary_key {
            enc.str(column);
        }

        let mut columns: Vec<&ColumnDescriptor> = table.columns.iter().collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        enc.len(columns.len());
        for column in columns {
            enc.tag(b'C');
            enc.str(&column.name);
            enc.str(column.sql_type.sqlite_name());
            enc.flag(column.nullable);
            enc.opt(column.default.to_sql().as_deref());
            enc.flag(column.primary_key);
            enc.flag(column.auto_increment);
            enc.opt(column.collation.as_deref());
        }

        enc.len(table.indices.len());
        for index in &table.indices {
            enc.tag(b'I');
            enc.str(&index.name);
            enc.flag(index.unique);
            enc.len(index.columns.len());
            for column in &index.columns {
                enc.str(column);
            }
        }

        enc.len(table.foreign_keys.len());
        for fk in &table.foreign_keys {
            enc.tag(b'F');
            enc.str(&fk.column);
            enc.str(&fk.references_table);
            enc.str(&fk.references_column);
            enc.str(fk.on_delete.to_sql());
            enc.str(fk.on_update.to_sql());
        }

        Self(enc.hasher.finalize().into())
    }

    /// Rebuilds a fingerprint from stored bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Returns the raw digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the digest as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

struct Encoder {
    hasher: Sha256,
}

impl Encoder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn tag(&mut self, tag: u8) {
        self.hasher.update([tag]);
    }

    fn len(&mut self, len: usize) {
        self.hasher.update((len as u64).to_le_bytes());
    }

    fn str(&mut self, value: &str) {
        self.len(value.len());
        self.hasher.update(value.as_bytes());
    }

    fn flag(&mut self, value: bool) {
        self.hasher.update([u8::from(value)]);
    }

    fn opt(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.tag(1);
                self.str(value);
            }
            None => self.tag(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ColumnDescriptor, DefaultValue, ForeignKeyDescriptor, IndexDescriptor, SqlType,
    };

    fn posts() -> TableDescriptor {
        TableDescriptor::new("posts")
            .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
            .column(ColumnDescriptor::new("author_id", SqlType::Integer).not_null())
            .column(ColumnDescriptor::new("title", SqlType::Text).not_null())
            .index(IndexDescriptor::new(["title"]).unique())
            .foreign_key(ForeignKeyDescriptor::new("author_id", "users", "id"))
    }

    #[test]
    fn test_stable_across_construction_order() {
        let reordered = TableDescriptor::new("posts")
            .column(ColumnDescriptor::new("title", SqlType::Custom("text".into())).not_null())
            .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
            .column(ColumnDescriptor::new("author_id", SqlType::Integer).not_null())
            .foreign_key(ForeignKeyDescriptor::new("author_id", "users", "id"))
            .index(IndexDescriptor::new(["title"]).unique().named("idx_posts_title"));

        assert_eq!(Fingerprint::of(&posts()), Fingerprint::of(&reordered));
    }

    #[test]
    fn test_structural_changes_change_the_hash() {
        let base = Fingerprint::of(&posts());

        let mut nullable = posts();
        nullable.columns[2].nullable = true;
        assert_ne!(base, Fingerprint::of(&nullable));

        let mut defaulted = posts();
        defaulted.columns[2].default = DefaultValue::String(String::new());
        assert_ne!(base, Fingerprint::of(&defaulted));

        let mut not_unique = posts();
        not_unique.indices[0].unique = false;
        assert_ne!(base, Fingerprint::of(&not_unique));

        let mut renamed = posts();
        renamed.name = "articles".into();
        assert_ne!(base, Fingerprint::of(&renamed));
    }

    #[test]
    fn test_bytes_round_trip() {
        let fp = Fingerprint::of(&posts());
        assert_eq!(Fingerprint::from_bytes(fp.as_bytes()), Some(fp));
        assert_eq!(Fingerprint::from_bytes(&[0u8; 3]), None);
        assert_eq!(fp.to_hex().len(), FINGERPRINT_LEN * 2);
    }
}
