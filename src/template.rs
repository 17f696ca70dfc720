// src/template.rs

//! Replacement-field resolution for boot entry templates
//!
//! Templates are plain strings with `{field}` or `{group.field}` references
//! (`{{`/`}}` escape literal braces). Resolution is strict substitution: a
//! field the context cannot supply fails the whole operation with
//! `UnresolvedField`, never a partial result. The context is a fully
//! populated snapshot of facts gathered before resolution begins, so the
//! same field always resolves to the same value within one operation.

use crate::block::{FileSystemFacts, PartitionFacts};
use crate::error::{Error, Result};
use crate::packages::Package;
use crate::snapshot::Snapshot;

/// Immutable fact context for one lifecycle operation
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    pub snapshot: &'a Snapshot,
    pub linux: &'a Package,
    pub machine_id: &'a str,
    /// EFI architecture identifier, if known for this machine
    pub architecture: Option<&'a str>,
    pub root_file_system: &'a FileSystemFacts,
    pub root_partition: &'a PartitionFacts,
}

impl ResolveContext<'_> {
    fn lookup(&self, field: &str) -> Option<String> {
        let (group, name) = match field.split_once('.') {
            Some((group, name)) => (group, name),
            None => ("", field),
        };

        match (group, name) {
            ("", "machine_id") => Some(self.machine_id.to_string()),
            ("", "architecture") => self.architecture.map(str::to_string),

            ("snapshot", "number") => Some(self.snapshot.number.to_string()),
            ("snapshot", "type") => Some(self.snapshot.kind.to_string()),
            ("snapshot", "pre_number") => self.snapshot.pre_number.map(|n| n.to_string()),
            ("snapshot", "date") => {
                self.snapshot.date.map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            ("snapshot", "user") => Some(self.snapshot.user.clone()),
            ("snapshot", "description") => Some(self.snapshot.description.clone()),
            ("snapshot", "cleanup_algorithm") => Some(self.snapshot.cleanup_algorithm.clone()),

            ("linux", "name") => Some(self.linux.name.clone()),
            ("linux", "version") => Some(self.linux.version.clone()),

            ("root_file_system", "file_system_type") => {
                Some(self.root_file_system.fstype.clone())
            }
            ("root_file_system", "subvol") => {
                self.root_file_system.subvol.as_ref().map(|subvol| subvol.display().to_string())
            }
            ("root_file_system", "uuid") => self.root_file_system.uuid.clone(),

            ("root_partition", "partition_table_type") => {
                self.root_partition.table_type.clone()
            }
            ("root_partition", "path") => self.root_partition.path.clone(),
            ("root_partition", "uuid") => self.root_partition.uuid.clone(),

            _ => None,
        }
    }
}

/// The field names referenced by a template, in order of appearance.
/// Malformed templates yield the fields found before the defect; `resolve`
/// is the place that rejects them.
pub fn referenced_fields(template: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let mut field = String::new();

                while let Some(c) = chars.next() {
                    if c == '}' {
                        fields.push(field.trim().to_string());
                        break;
                    }
                    field.push(c);
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
            }
            _ => {}
        }
    }

    fields
}

/// Resolve every replacement field in `template` against `context`.
pub fn resolve(template: &str, context: &ResolveContext<'_>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                result.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                result.push('}');
            }
            '{' => {
                let mut field = String::new();

                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => {
                            return Err(Error::ParseError(format!(
                                "Unterminated replacement field in template: {}",
                                template
                            )));
                        }
                    }
                }

                match context.lookup(field.trim()) {
                    Some(value) => result.push_str(&value),
                    None => return Err(Error::UnresolvedField(field.trim().to_string())),
                }
            }
            '}' => {
                return Err(Error::ParseError(format!(
                    "Unmatched closing brace in template: {}",
                    template
                )));
            }
            c => result.push(c),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn snapshot() -> Snapshot {
        Snapshot {
            number: 42,
            kind: SnapshotKind::Pre,
            pre_number: None,
            date: None,
            user: "root".to_string(),
            description: "pacman -Syu".to_string(),
            cleanup_algorithm: "number".to_string(),
            userdata: BTreeMap::new(),
        }
    }

    fn linux() -> Package {
        Package { name: "linux".to_string(), version: "6.8.2.arch1-1".to_string() }
    }

    fn file_system() -> FileSystemFacts {
        FileSystemFacts {
            fstype: "btrfs".to_string(),
            subvol: Some(PathBuf::from("/@")),
            uuid: Some("aaaa-bbbb".to_string()),
        }
    }

    fn partition() -> PartitionFacts {
        PartitionFacts {
            path: Some("/dev/nvme0n1p2".to_string()),
            uuid: Some("cccc-dddd".to_string()),
            table_type: Some("gpt".to_string()),
        }
    }

    fn with_context<F: FnOnce(&ResolveContext<'_>)>(f: F) {
        let snapshot = snapshot();
        let linux = linux();
        let file_system = file_system();
        let partition = partition();
        let context = ResolveContext {
            snapshot: &snapshot,
            linux: &linux,
            machine_id: "0123456789abcdef",
            architecture: Some("X64"),
            root_file_system: &file_system,
            root_partition: &partition,
        };
        f(&context);
    }

    #[test]
    fn resolves_simple_and_dotted_fields() {
        with_context(|context| {
            assert_eq!(
                resolve("/{machine_id}/{linux.version}/vmlinuz-linux", context).unwrap(),
                "/0123456789abcdef/6.8.2.arch1-1/vmlinuz-linux"
            );
            assert_eq!(
                resolve("snapshot {snapshot.number} ({snapshot.type})", context).unwrap(),
                "snapshot 42 (pre)"
            );
            assert_eq!(
                resolve("UUID={root_file_system.uuid}", context).unwrap(),
                "UUID=aaaa-bbbb"
            );
            assert_eq!(resolve("{root_partition.path}", context).unwrap(), "/dev/nvme0n1p2");
        });
    }

    #[test]
    fn unknown_field_fails_with_unresolved_field() {
        with_context(|context| {
            let result = resolve("{bogus}", context);
            assert!(matches!(result, Err(Error::UnresolvedField(field)) if field == "bogus"));

            let result = resolve("{snapshot.bogus}", context);
            assert!(matches!(result, Err(Error::UnresolvedField(_))));
        });
    }

    #[test]
    fn absent_optional_fact_fails_rather_than_substituting_empty() {
        with_context(|_| {});

        let snapshot = snapshot();
        let linux = linux();
        let file_system =
            FileSystemFacts { fstype: "btrfs".to_string(), subvol: None, uuid: None };
        let partition = PartitionFacts::default();
        let context = ResolveContext {
            snapshot: &snapshot,
            linux: &linux,
            machine_id: "m",
            architecture: None,
            root_file_system: &file_system,
            root_partition: &partition,
        };

        for template in
            ["{architecture}", "{root_file_system.uuid}", "{root_partition.path}", "{snapshot.pre_number}"]
        {
            assert!(
                matches!(resolve(template, &context), Err(Error::UnresolvedField(_))),
                "{} should be unresolved",
                template
            );
        }
    }

    #[test]
    fn escaped_braces_are_literal() {
        with_context(|context| {
            assert_eq!(resolve("{{literal}} {machine_id}", context).unwrap(),
                "{literal} 0123456789abcdef");
        });
    }

    #[test]
    fn referenced_fields_lists_in_order() {
        assert_eq!(
            referenced_fields("/{machine_id}/{linux.version}/vmlinuz-{{x}}"),
            vec!["machine_id".to_string(), "linux.version".to_string()]
        );
        assert!(referenced_fields("plain").is_empty());
    }

    #[test]
    fn malformed_templates_are_rejected() {
        with_context(|context| {
            assert!(matches!(resolve("{open", context), Err(Error::ParseError(_))));
            assert!(matches!(resolve("close}", context), Err(Error::ParseError(_))));
        });
    }
}
