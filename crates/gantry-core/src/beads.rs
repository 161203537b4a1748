//! The beads store: one append-mostly JSONL file per repository, one issue
//! record per line, keyed by local id.
//!
//! The file is merged line-wise by id when local pushes race with ours; the
//! field-level rules live in [`merge_lines`] and mirror the custom git merge
//! driver semantics: absent fields in a changed record count as "unchanged
//! from base" (the merge tool is known to elide a zero-valued priority).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::issue::Issue;

pub const BEADS_DIR: &str = ".beads";
pub const ISSUES_FILE: &str = "issues.jsonl";

pub struct BeadsStore {
    path: PathBuf,
}

impl BeadsStore {
    /// Store rooted at a repository working tree (`<repo>/.beads/issues.jsonl`).
    pub fn in_repo(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            path: repo_dir.as_ref().join(BEADS_DIR).join(ISSUES_FILE),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all issues. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<String, Issue>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        parse_jsonl(&contents)
    }

    /// Serialize and atomically replace the file (write temp, rename).
    pub fn save(&self, issues: &BTreeMap<String, Issue>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let mut out = String::new();
        for issue in issues.values() {
            out.push_str(&serde_json::to_string(issue)?);
            out.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, out).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }

    /// Whether an id is present in the on-disk file right now. Used after
    /// conflict reconciliation to confirm the record-of-interest survived.
    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.load()?.contains_key(id))
    }
}

fn parse_jsonl(contents: &str) -> Result<BTreeMap<String, Issue>> {
    let mut map = BTreeMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(line)
            .with_context(|| format!("malformed issue record on line {}", lineno + 1))?;
        let id = crate::issue::validate_id(&issue.id)?;
        map.insert(id, issue);
    }
    Ok(map)
}

// ── Line-wise three-way merge ────────────────────────────────────────────

fn lines_to_values(contents: &str) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(line) {
            if let Some(id) = v.get("id").and_then(Value::as_str) {
                map.insert(id.to_string(), v);
            }
        }
    }
    map
}

fn updated_at_of(v: &Value) -> &str {
    v.get("updated_at").and_then(Value::as_str).unwrap_or("")
}

/// Three-way merge of one record. `None` means the record is absent on that
/// side; returning `None` means the merged file drops it.
fn merge_record(base: Option<&Value>, ours: Option<&Value>, theirs: Option<&Value>) -> Option<Value> {
    match (base, ours, theirs) {
        (_, None, None) => None,
        (None, Some(o), None) => Some(o.clone()),
        (None, None, Some(t)) => Some(t.clone()),
        // One side deleted, the other left it untouched: the deletion wins.
        (Some(b), Some(o), None) => (o != b).then(|| o.clone()),
        (Some(b), None, Some(t)) => (t != b).then(|| t.clone()),
        (None, Some(o), Some(t)) => Some(merge_fields(None, o, t)),
        (Some(b), Some(o), Some(t)) => {
            if o == t {
                Some(o.clone())
            } else if o == b {
                Some(t.clone())
            } else if t == b {
                Some(o.clone())
            } else {
                Some(merge_fields(Some(b), o, t))
            }
        }
    }
}

/// Field-level merge when both sides changed the same record.
///
/// A field absent from a changed record is read as "unchanged from base",
/// never as a reset; with no base the newer side's record wins wholesale
/// for fields only it carries.
fn merge_fields(base: Option<&Value>, ours: &Value, theirs: &Value) -> Value {
    let ours_newer = updated_at_of(ours) >= updated_at_of(theirs);
    let empty = serde_json::Map::new();
    let base_map = base.and_then(Value::as_object).unwrap_or(&empty);
    let ours_map = ours.as_object().unwrap_or(&empty);
    let theirs_map = theirs.as_object().unwrap_or(&empty);

    let mut keys: Vec<&String> = base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
        .collect();
    keys.sort();
    keys.dedup();

    let mut merged = serde_json::Map::new();
    for key in keys {
        let b = base_map.get(key);
        let o = ours_map.get(key).or(b);
        let t = theirs_map.get(key).or(b);
        let picked = match (b, o, t) {
            (_, Some(o), Some(t)) if o == t => Some(o),
            (Some(b), Some(o), Some(t)) => {
                if o == b {
                    Some(t)
                } else if t == b {
                    Some(o)
                } else if ours_newer {
                    Some(o)
                } else {
                    Some(t)
                }
            }
            (None, Some(o), Some(t)) => Some(if ours_newer { o } else { t }),
            (_, Some(o), None) => Some(o),
            (_, None, Some(t)) => Some(t),
            (_, None, None) => None,
        };
        if let Some(v) = picked {
            merged.insert(key.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

/// Merge two divergent versions of the JSONL file against their common
/// base, line-wise by id. Output is sorted by id, one record per line.
pub fn merge_lines(base: &str, ours: &str, theirs: &str) -> Result<String> {
    let base_map = lines_to_values(base);
    let ours_map = lines_to_values(ours);
    let theirs_map = lines_to_values(theirs);

    let mut ids: Vec<&String> = base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
        .collect();
    ids.sort();
    ids.dedup();

    let mut out = String::new();
    for id in ids {
        let merged = merge_record(base_map.get(id), ours_map.get(id), theirs_map.get(id));
        if let Some(v) = merged {
            out.push_str(&serde_json::to_string(&v)?);
            out.push('\n');
        }
    }
    Ok(out)
}
