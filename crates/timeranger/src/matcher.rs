//! Filter evaluation against one metadata record.
//!
//! A match condition is compiled once from a JSON filter object and then
//! evaluated per record. All present keys are AND-ed; an absent or empty
//! filter matches everything. Range bounds double as early-termination
//! signals for ordered scans: a `to_*` bound ends forward scans once passed,
//! a `from_*` bound ends backward scans.

use regex::Regex;
use serde_json::Value;

use crate::codec::{MetaRecord, RecordState};
use crate::error::{Result, TrError};
use crate::timeparse;

/// A record's partition key, typed per the owning topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// String partition key.
    Str(String),
    /// Positive integer partition key.
    Int(i64),
}

impl RecordKey {
    /// Directory name for this key's partition.
    pub fn dir_name(&self) -> String {
        match self {
            RecordKey::Str(s) => s.clone(),
            RecordKey::Int(i) => i.to_string(),
        }
    }

    /// Reconstructs a key from its partition directory name.
    pub fn from_dir_name(name: &str, int_key: bool) -> Option<Self> {
        if int_key {
            name.parse::<i64>().ok().map(RecordKey::Int)
        } else {
            Some(RecordKey::Str(name.to_string()))
        }
    }
}

/// One `key`/`notkey` candidate, kept in both representations so a filter
/// written with strings still matches an int-key topic.
#[derive(Debug, Clone)]
struct KeyCandidate {
    text: String,
    int: Option<i64>,
}

impl KeyCandidate {
    fn matches(&self, key: &RecordKey) -> bool {
        match key {
            RecordKey::Str(s) => self.text == *s,
            RecordKey::Int(i) => self.int == Some(*i),
        }
    }
}

/// Per-key scan context used to resolve negative (relative) bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanBounds {
    /// Rowid of the last record under the key.
    pub last_rowid: i64,
    /// `t` of the last record under the key.
    pub last_t: u64,
    /// `tm` of the last record under the key.
    pub last_tm: u64,
}

/// Outcome of evaluating a condition against one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// The record satisfies the condition.
    pub matched: bool,
    /// A `to_*` bound lies behind this record; a forward scan may stop.
    pub end_forward: bool,
    /// A `from_*` bound lies ahead of this record; a backward scan may stop.
    pub end_backward: bool,
}

/// A time or rowid bound: absolute, or negative meaning "N back from the
/// last record".
#[derive(Debug, Clone, Copy)]
struct Bound(i64);

impl Bound {
    fn resolve(self, last: i64) -> i64 {
        if self.0 < 0 {
            last + self.0
        } else {
            self.0
        }
    }
}

/// Compiled match condition.
#[derive(Debug, Default)]
pub struct MatchCond {
    key: Option<Vec<KeyCandidate>>,
    notkey: Option<Vec<KeyCandidate>>,
    rkey: Option<Regex>,
    from_rowid: Option<Bound>,
    to_rowid: Option<Bound>,
    from_t: Option<Bound>,
    to_t: Option<Bound>,
    from_tm: Option<Bound>,
    to_tm: Option<Bound>,
    user_flag: Option<u32>,
    not_user_flag: Option<u32>,
    user_flag_mask_set: Option<u32>,
    user_flag_mask_notset: Option<u32>,
    include_deleted: bool,
    empty: bool,
}

impl MatchCond {
    /// Compiles a filter object. `Null` or an empty object matches
    /// everything.
    ///
    /// # Errors
    ///
    /// Returns `TrError::Parameter` if the filter is not an object, a bound
    /// is unparseable, or an `rkey` pattern is invalid.
    pub fn compile(filter: &Value) -> Result<Self> {
        let map = match filter {
            Value::Null => return Ok(Self::match_all()),
            Value::Object(map) if map.is_empty() => return Ok(Self::match_all()),
            Value::Object(map) => map,
            other => {
                return Err(TrError::Parameter(format!(
                    "match condition must be an object, got {}",
                    other
                )))
            }
        };

        let mut cond = MatchCond::default();
        for (name, value) in map {
            match name.as_str() {
                "key" => cond.key = Some(key_candidates(value)?),
                "notkey" => cond.notkey = Some(key_candidates(value)?),
                "rkey" => {
                    let pattern = value.as_str().ok_or_else(|| {
                        TrError::Parameter("rkey must be a string pattern".into())
                    })?;
                    cond.rkey = Some(Regex::new(pattern).map_err(|e| {
                        TrError::Parameter(format!("invalid rkey pattern: {}", e))
                    })?);
                }
                "from_rowid" => cond.from_rowid = Some(int_bound(name, value)?),
                "to_rowid" => cond.to_rowid = Some(int_bound(name, value)?),
                "from_t" => cond.from_t = Some(time_bound(name, value)?),
                "to_t" => cond.to_t = Some(time_bound(name, value)?),
                "from_tm" => cond.from_tm = Some(time_bound(name, value)?),
                "to_tm" => cond.to_tm = Some(time_bound(name, value)?),
                "user_flag" => cond.user_flag = Some(flag_value(name, value)?),
                "not_user_flag" => cond.not_user_flag = Some(flag_value(name, value)?),
                "user_flag_mask_set" => cond.user_flag_mask_set = Some(flag_value(name, value)?),
                "user_flag_mask_notset" => {
                    cond.user_flag_mask_notset = Some(flag_value(name, value)?)
                }
                "deleted" => cond.include_deleted = value.as_bool().unwrap_or(false),
                // Unknown keys are record-content conditions we do not
                // index; they are ignored here by contract.
                _ => {}
            }
        }
        Ok(cond)
    }

    fn match_all() -> Self {
        Self {
            empty: true,
            ..Self::default()
        }
    }

    /// Returns true if the condition matches every record.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Returns true if the condition restricts the partition key at all.
    pub fn restricts_key(&self) -> bool {
        self.key.is_some() || self.notkey.is_some() || self.rkey.is_some()
    }

    /// Returns the single key candidate when the condition pins exactly one.
    pub fn single_key(&self) -> Option<RecordKey> {
        match &self.key {
            Some(cands) if cands.len() == 1 => {
                let c = &cands[0];
                Some(match c.int {
                    Some(i) => RecordKey::Int(i),
                    None => RecordKey::Str(c.text.clone()),
                })
            }
            _ => None,
        }
    }

    /// Returns the compiled `rkey` pattern, if any.
    pub fn key_pattern(&self) -> Option<&Regex> {
        self.rkey.as_ref()
    }

    /// Returns true if the condition pins or restricts to this key (without
    /// looking at any record fields). Used to skip whole partitions.
    pub fn accepts_key(&self, key: &RecordKey) -> bool {
        if let Some(cands) = &self.key {
            if !cands.iter().any(|c| c.matches(key)) {
                return false;
            }
        }
        if let Some(cands) = &self.notkey {
            if cands.iter().any(|c| c.matches(key)) {
                return false;
            }
        }
        if let Some(re) = &self.rkey {
            match key {
                RecordKey::Str(s) => {
                    if !re.is_match(s) {
                        return false;
                    }
                }
                // Regex keys apply to string-key topics only.
                RecordKey::Int(_) => return false,
            }
        }
        true
    }

    /// Evaluates the condition against one metadata record.
    pub fn eval(
        &self,
        key: &RecordKey,
        rowid: i64,
        bounds: &ScanBounds,
        meta: &MetaRecord,
    ) -> MatchOutcome {
        let mut out = MatchOutcome::default();

        // Range bounds drive termination signals even when the record
        // itself fails some other clause.
        if let Some(b) = self.to_rowid {
            if rowid > b.resolve(bounds.last_rowid) {
                out.end_forward = true;
            }
        }
        if let Some(b) = self.to_t {
            if meta.t as i64 > b.resolve(bounds.last_t as i64) {
                out.end_forward = true;
            }
        }
        if let Some(b) = self.to_tm {
            if meta.tm as i64 > b.resolve(bounds.last_tm as i64) {
                out.end_forward = true;
            }
        }
        if let Some(b) = self.from_rowid {
            if rowid < b.resolve(bounds.last_rowid) {
                out.end_backward = true;
            }
        }
        if let Some(b) = self.from_t {
            if (meta.t as i64) < b.resolve(bounds.last_t as i64) {
                out.end_backward = true;
            }
        }
        if let Some(b) = self.from_tm {
            if (meta.tm as i64) < b.resolve(bounds.last_tm as i64) {
                out.end_backward = true;
            }
        }

        match meta.state {
            RecordState::HardDeleted => return out,
            RecordState::SoftDeleted if !self.include_deleted => return out,
            _ => {}
        }

        if out.end_forward || out.end_backward {
            return out;
        }
        if !self.accepts_key(key) {
            return out;
        }

        if let Some(flag) = self.user_flag {
            if meta.user_flag != flag {
                return out;
            }
        }
        if let Some(flag) = self.not_user_flag {
            if meta.user_flag == flag {
                return out;
            }
        }
        if let Some(mask) = self.user_flag_mask_set {
            if meta.user_flag & mask != mask {
                return out;
            }
        }
        if let Some(mask) = self.user_flag_mask_notset {
            if meta.user_flag & mask != 0 {
                return out;
            }
        }

        out.matched = true;
        out
    }
}

fn key_candidates(value: &Value) -> Result<Vec<KeyCandidate>> {
    let mut cands = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                cands.push(one_candidate(item)?);
            }
        }
        Value::Object(map) => {
            for name in map.keys() {
                cands.push(KeyCandidate {
                    text: name.clone(),
                    int: name.parse().ok(),
                });
            }
        }
        scalar => cands.push(one_candidate(scalar)?),
    }
    Ok(cands)
}

fn one_candidate(value: &Value) -> Result<KeyCandidate> {
    match value {
        Value::String(s) => Ok(KeyCandidate {
            text: s.clone(),
            int: s.parse().ok(),
        }),
        Value::Number(n) => {
            let i = n
                .as_i64()
                .ok_or_else(|| TrError::Parameter(format!("bad key candidate {}", n)))?;
            Ok(KeyCandidate {
                text: i.to_string(),
                int: Some(i),
            })
        }
        other => Err(TrError::Parameter(format!(
            "key candidate must be string or integer, got {}",
            other
        ))),
    }
}

fn int_bound(name: &str, value: &Value) -> Result<Bound> {
    value
        .as_i64()
        .map(Bound)
        .ok_or_else(|| TrError::Parameter(format!("{} must be an integer", name)))
}

fn time_bound(name: &str, value: &Value) -> Result<Bound> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Bound)
            .ok_or_else(|| TrError::Parameter(format!("{} out of range", name))),
        Value::String(s) => timeparse::parse_time(s)
            .map(Bound)
            .ok_or_else(|| TrError::Parameter(format!("{}: unparseable time {:?}", name, s))),
        other => Err(TrError::Parameter(format!(
            "{} must be an integer or time string, got {}",
            name, other
        ))),
    }
}

fn flag_value(name: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| TrError::Parameter(format!("{} must fit in 32 bits", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(t: u64, tm: u64) -> MetaRecord {
        MetaRecord::new(t, tm, 0, 10)
    }

    fn bounds(last_rowid: i64, last_t: u64) -> ScanBounds {
        ScanBounds {
            last_rowid,
            last_t,
            last_tm: last_t,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let cond = MatchCond::compile(&json!({})).unwrap();
        assert!(cond.is_empty());
        let out = cond.eval(
            &RecordKey::Str("k".into()),
            0,
            &ScanBounds::default(),
            &meta(1, 1),
        );
        assert!(out.matched);

        let cond = MatchCond::compile(&Value::Null).unwrap();
        assert!(cond.is_empty());
    }

    #[test]
    fn key_equality_and_membership() {
        let cond = MatchCond::compile(&json!({"key": "sensor1"})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Str("sensor1".into())));
        assert!(!cond.accepts_key(&RecordKey::Str("sensor2".into())));

        let cond = MatchCond::compile(&json!({"key": ["a", "b"]})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Str("b".into())));
        assert!(!cond.accepts_key(&RecordKey::Str("c".into())));

        let cond = MatchCond::compile(&json!({"key": {"a": 1, "b": 1}})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Str("a".into())));
    }

    #[test]
    fn int_keys_match_string_candidates() {
        let cond = MatchCond::compile(&json!({"key": "42"})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Int(42)));
        assert!(!cond.accepts_key(&RecordKey::Int(43)));

        let cond = MatchCond::compile(&json!({"key": 42})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Int(42)));
    }

    #[test]
    fn notkey_excludes() {
        let cond = MatchCond::compile(&json!({"notkey": ["a"]})).unwrap();
        assert!(!cond.accepts_key(&RecordKey::Str("a".into())));
        assert!(cond.accepts_key(&RecordKey::Str("b".into())));
    }

    #[test]
    fn rkey_regex_over_string_keys() {
        let cond = MatchCond::compile(&json!({"rkey": "^sensor[0-9]+$"})).unwrap();
        assert!(cond.accepts_key(&RecordKey::Str("sensor7".into())));
        assert!(!cond.accepts_key(&RecordKey::Str("pump1".into())));
        assert!(!cond.accepts_key(&RecordKey::Int(7)));
        assert!(MatchCond::compile(&json!({"rkey": "("})).is_err());
    }

    #[test]
    fn t_range_with_end_signal() {
        let cond = MatchCond::compile(&json!({"from_t": 30, "to_t": 70})).unwrap();
        let key = RecordKey::Str("k".into());
        let b = bounds(9, 100);

        let out = cond.eval(&key, 2, &b, &meta(20, 0));
        assert!(!out.matched);
        assert!(out.end_backward);
        assert!(!out.end_forward);

        let out = cond.eval(&key, 5, &b, &meta(50, 0));
        assert!(out.matched);

        let out = cond.eval(&key, 8, &b, &meta(80, 0));
        assert!(!out.matched);
        assert!(out.end_forward);
    }

    #[test]
    fn iso_time_bounds() {
        let cond =
            MatchCond::compile(&json!({"from_t": "2024-01-01T00:00:00Z"})).unwrap();
        let key = RecordKey::Str("k".into());
        let out = cond.eval(&key, 0, &bounds(0, 2_000_000_000), &meta(1_704_067_200, 0));
        assert!(out.matched);
        let out = cond.eval(&key, 0, &bounds(0, 2_000_000_000), &meta(1_704_067_199, 0));
        assert!(!out.matched);
    }

    #[test]
    fn negative_rowid_bound_counts_from_last() {
        // last_rowid 9, to_rowid -2 resolves to 7: rows 8 and 9 excluded.
        let cond = MatchCond::compile(&json!({"to_rowid": -2})).unwrap();
        let key = RecordKey::Str("k".into());
        let b = bounds(9, 0);
        assert!(cond.eval(&key, 7, &b, &meta(1, 0)).matched);
        let out = cond.eval(&key, 8, &b, &meta(1, 0));
        assert!(!out.matched);
        assert!(out.end_forward);
    }

    #[test]
    fn user_flag_clauses() {
        let key = RecordKey::Str("k".into());
        let b = ScanBounds::default();
        let mut m = meta(1, 1);
        m.user_flag = 0b1010;

        let cond = MatchCond::compile(&json!({"user_flag": 10})).unwrap();
        assert!(cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"not_user_flag": 10})).unwrap();
        assert!(!cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"user_flag_mask_set": 0b0010})).unwrap();
        assert!(cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"user_flag_mask_set": 0b0100})).unwrap();
        assert!(!cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"user_flag_mask_notset": 0b0100})).unwrap();
        assert!(cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"user_flag_mask_notset": 0b0010})).unwrap();
        assert!(!cond.eval(&key, 0, &b, &m).matched);
    }

    #[test]
    fn deleted_records_hidden_by_default() {
        let key = RecordKey::Str("k".into());
        let b = ScanBounds::default();
        let mut m = meta(1, 1);
        m.state = RecordState::SoftDeleted;

        let cond = MatchCond::compile(&json!({})).unwrap();
        assert!(!cond.eval(&key, 0, &b, &m).matched);

        let cond = MatchCond::compile(&json!({"deleted": true})).unwrap();
        assert!(cond.eval(&key, 0, &b, &m).matched);

        m.state = RecordState::HardDeleted;
        assert!(!cond.eval(&key, 0, &b, &m).matched);
    }

    #[test]
    fn single_key_extraction() {
        let cond = MatchCond::compile(&json!({"key": "sensor1"})).unwrap();
        assert_eq!(
            cond.single_key(),
            Some(RecordKey::Str("sensor1".into()))
        );
        let cond = MatchCond::compile(&json!({"key": ["a", "b"]})).unwrap();
        assert_eq!(cond.single_key(), None);
    }

    #[test]
    fn non_object_filter_rejected() {
        assert!(MatchCond::compile(&json!(42)).is_err());
        assert!(MatchCond::compile(&json!("key")).is_err());
    }
}
