use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::{Client, CustomRedisError, WriteOp};

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MockState {
    data: HashMap<String, Slot>,
    op_failures: HashMap<String, CustomRedisError>,
    key_failures: HashMap<(String, String), CustomRedisError>,
}

/// In-memory stand-in for Redis.
///
/// Unlike a canned-response mock this one keeps real state, so several
/// components sharing one client see each other's writes. Expiry follows
/// `tokio::time`, which lets tests pause and advance the clock. Clones share
/// the same store and call log.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
    Score(String, f64),
    Range(isize, isize),
    Writes(Vec<WriteOp>),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

fn wrong_type() -> CustomRedisError {
    CustomRedisError::ParseError(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

// Redis-style inclusive range with negative indices counting from the end.
fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || start > stop || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn add_to_integer(hash: &mut BTreeMap<String, String>, field: String, by: i64) -> Result<(), CustomRedisError> {
    let current = match hash.get(&field) {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| CustomRedisError::ParseError("hash value is not an integer".to_string()))?,
        None => 0,
    };
    hash.insert(field, (current + by).to_string());
    Ok(())
}

// Applies one write to the staged copies of the touched keys.
fn apply_write(staged: &mut HashMap<String, Slot>, op: WriteOp) -> Result<(), CustomRedisError> {
    match op {
        WriteOp::SetEx {
            key,
            value,
            seconds,
        } => {
            staged.insert(
                key,
                Slot {
                    value: Stored::Str(value),
                    expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
                },
            );
        }
        WriteOp::LPushExpire {
            key,
            value,
            seconds,
        } => {
            let slot = staged.entry(key).or_insert(Slot {
                value: Stored::List(VecDeque::new()),
                expires_at: None,
            });
            let Stored::List(list) = &mut slot.value else {
                return Err(wrong_type());
            };
            list.push_front(value);
            slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        WriteOp::HIncrByExpire {
            key,
            increments,
            seconds,
        } => {
            let slot = staged.entry(key).or_insert(Slot {
                value: Stored::Hash(BTreeMap::new()),
                expires_at: None,
            });
            let Stored::Hash(hash) = &mut slot.value else {
                return Err(wrong_type());
            };
            for (field, by) in increments {
                add_to_integer(hash, field, by)?;
            }
            slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
    }
    Ok(())
}

fn sorted_desc(zset: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut entries: Vec<(String, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    entries
}

impl MockState {
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        let expired = self
            .data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.data.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        self.purge_expired(key);
        self.data.get_mut(key)
    }

    fn slot_or_insert(&mut self, key: &str, empty: Stored) -> &mut Slot {
        self.purge_expired(key);
        self.data.entry(key.to_owned()).or_insert(Slot {
            value: empty,
            expires_at: None,
        })
    }

    fn put(&mut self, key: String, value: String, ttl: Option<Duration>) {
        self.data.insert(
            key,
            Slot {
                value: Stored::Str(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>, CustomRedisError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Stored::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(wrong_type()),
        }
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the calls mutex
    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockRedisCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the call and return the injected failure for it, if any.
    fn record(&self, op: &str, key: &str, value: MockRedisValue) -> Result<(), CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });

        let state = self.lock_state();
        if let Some(err) = state
            .key_failures
            .get(&(op.to_string(), key.to_string()))
        {
            return Err(err.clone());
        }
        match state.op_failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Make every call of `op` fail with `err`.
    pub fn fail_op(&mut self, op: &str, err: CustomRedisError) -> Self {
        self.lock_state().op_failures.insert(op.to_owned(), err);
        self.clone()
    }

    /// Make calls of `op` on `key` fail with `err`.
    pub fn fail_key(&mut self, op: &str, key: &str, err: CustomRedisError) -> Self {
        self.lock_state()
            .key_failures
            .insert((op.to_owned(), key.to_owned()), err);
        self.clone()
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock_state();
        state.op_failures.clear();
        state.key_failures.clear();
    }

    /// Seed a string value (`Ok`) or make `get` on the key fail (`Err`).
    pub fn get_ret(&mut self, key: &str, ret: Result<String, CustomRedisError>) -> Self {
        match ret {
            Ok(value) => self.lock_state().put(key.to_owned(), value, None),
            Err(CustomRedisError::NotFound) => {
                self.lock_state().data.remove(key);
            }
            Err(err) => {
                self.fail_key("get", key, err);
            }
        }
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.lock_calls().iter().filter(|c| c.op == op).count()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock_state().live(key).is_some()
    }

    /// Remaining time to live, `None` for missing or persistent keys.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.lock_state();
        let expires_at = state.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None)?;

        match self.lock_state().live(&key) {
            Some(Slot {
                value: Stored::Str(value),
                ..
            }) => Ok(value.clone()),
            Some(_) => Err(wrong_type()),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(&self, key: String, value: String) -> Result<(), CustomRedisError> {
        self.record("set", &key, MockRedisValue::String(value.clone()))?;
        self.lock_state().put(key, value, None);
        Ok(())
    }

    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        )?;
        self.lock_state()
            .put(key, value, Some(Duration::from_secs(seconds)));
        Ok(())
    }

    async fn psetex(&self, key: String, value: String, millis: u64) -> Result<(), CustomRedisError> {
        self.record(
            "psetex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), millis),
        )?;
        self.lock_state()
            .put(key, value, Some(Duration::from_millis(millis)));
        Ok(())
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None)?;
        self.lock_state().data.remove(&key);
        Ok(())
    }

    async fn expire(&self, key: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record("expire", &key, MockRedisValue::None)?;
        if let Some(slot) = self.lock_state().live(&key) {
            slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn set_nx_px(
        &self,
        key: String,
        value: String,
        millis: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "set_nx_px",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), millis),
        )?;

        let mut state = self.lock_state();
        if state.live(&key).is_some() {
            return Ok(false);
        }
        state.put(key, value, Some(Duration::from_millis(millis)));
        Ok(true)
    }

    async fn pexpire_if_eq(
        &self,
        key: String,
        expected: String,
        millis: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "pexpire_if_eq",
            &key,
            MockRedisValue::StringWithTTL(expected.clone(), millis),
        )?;

        match self.lock_state().live(&key) {
            Some(slot) if matches!(&slot.value, Stored::Str(v) if *v == expected) => {
                slot.expires_at = Some(Instant::now() + Duration::from_millis(millis));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del_if_eq(&self, key: String, expected: String) -> Result<bool, CustomRedisError> {
        self.record("del_if_eq", &key, MockRedisValue::String(expected.clone()))?;

        let mut state = self.lock_state();
        let matches = matches!(
            state.live(&key),
            Some(Slot { value: Stored::Str(v), .. }) if *v == expected
        );
        if matches {
            state.data.remove(&key);
        }
        Ok(matches)
    }

    async fn sadd_expire(
        &self,
        key: String,
        member: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "sadd_expire",
            &key,
            MockRedisValue::StringWithTTL(member.clone(), seconds),
        )?;

        let mut state = self.lock_state();
        let slot = state.slot_or_insert(&key, Stored::Set(BTreeSet::new()));
        let Stored::Set(set) = &mut slot.value else {
            return Err(wrong_type());
        };
        let added = set.insert(member);
        slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        Ok(added)
    }

    async fn sismember(&self, key: String, member: String) -> Result<bool, CustomRedisError> {
        self.record("sismember", &key, MockRedisValue::String(member.clone()))?;

        match self.lock_state().live(&key) {
            None => Ok(false),
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => Ok(set.contains(&member)),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn scard(&self, key: String) -> Result<u64, CustomRedisError> {
        self.record("scard", &key, MockRedisValue::None)?;

        match self.lock_state().live(&key) {
            None => Ok(0),
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn hgetall(&self, key: String) -> Result<HashMap<String, String>, CustomRedisError> {
        self.record("hgetall", &key, MockRedisValue::None)?;

        match self.lock_state().live(&key) {
            None => Ok(HashMap::new()),
            Some(Slot {
                value: Stored::Hash(hash),
                ..
            }) => Ok(hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Recorded as one call keyed by the first op's key; a `fail_key` on any
    /// touched key fails the whole transaction.
    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), CustomRedisError> {
        let first = ops.first().map(|op| op.key().to_string()).unwrap_or_default();
        self.record("atomic_write", &first, MockRedisValue::Writes(ops.clone()))?;
        {
            let state = self.lock_state();
            for op in &ops {
                let failure = ("atomic_write".to_string(), op.key().to_string());
                if let Some(err) = state.key_failures.get(&failure) {
                    return Err(err.clone());
                }
            }
        }

        let mut state = self.lock_state();
        let mut staged: HashMap<String, Slot> = HashMap::new();
        for op in ops {
            let key = op.key().to_string();
            if !staged.contains_key(&key) {
                if let Some(slot) = state.live(&key) {
                    staged.insert(key, slot.clone());
                }
            }
            apply_write(&mut staged, op)?;
        }
        state.data.extend(staged);
        Ok(())
    }

    async fn lrange(
        &self,
        key: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError> {
        self.record("lrange", &key, MockRedisValue::Range(start, stop))?;

        match self.lock_state().live(&key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Stored::List(list),
                ..
            }) => Ok(match normalize_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn zadd(&self, key: String, member: String, score: f64) -> Result<(), CustomRedisError> {
        self.record("zadd", &key, MockRedisValue::Score(member.clone(), score))?;

        let mut state = self.lock_state();
        let slot = state.slot_or_insert(&key, Stored::ZSet(HashMap::new()));
        let Stored::ZSet(zset) = &mut slot.value else {
            return Err(wrong_type());
        };
        zset.insert(member, score);
        Ok(())
    }

    async fn zrevrange_withscores(
        &self,
        key: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, CustomRedisError> {
        self.record("zrevrange_withscores", &key, MockRedisValue::Range(start, stop))?;

        let mut state = self.lock_state();
        let Some(zset) = state.zset(&key)? else {
            return Ok(Vec::new());
        };
        let entries = sorted_desc(zset);
        Ok(match normalize_range(entries.len(), start, stop) {
            Some((from, to)) => entries[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrevrank(&self, key: String, member: String) -> Result<Option<u64>, CustomRedisError> {
        self.record("zrevrank", &key, MockRedisValue::String(member.clone()))?;

        let mut state = self.lock_state();
        let Some(zset) = state.zset(&key)? else {
            return Ok(None);
        };
        Ok(sorted_desc(zset)
            .iter()
            .position(|(m, _)| *m == member)
            .map(|rank| rank as u64))
    }

    async fn zscore(&self, key: String, member: String) -> Result<Option<f64>, CustomRedisError> {
        self.record("zscore", &key, MockRedisValue::String(member.clone()))?;

        let mut state = self.lock_state();
        Ok(state.zset(&key)?.and_then(|zset| zset.get(&member).copied()))
    }

    async fn zremrangebyrank(
        &self,
        key: String,
        start: isize,
        stop: isize,
    ) -> Result<u64, CustomRedisError> {
        self.record("zremrangebyrank", &key, MockRedisValue::Range(start, stop))?;

        let mut state = self.lock_state();
        let Some(zset) = state.zset(&key)? else {
            return Ok(0);
        };
        let mut ascending = sorted_desc(zset);
        ascending.reverse();
        let Some((from, to)) = normalize_range(ascending.len(), start, stop) else {
            return Ok(0);
        };
        for (member, _) in &ascending[from..=to] {
            zset.remove(member);
        }
        Ok((to - from + 1) as u64)
    }
}
