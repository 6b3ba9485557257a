use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use siphasher::sip::SipHasher13;
use tokio::sync::Notify;

use super::{Publisher, Record, RecordSource, TransportError};

/// In-process partitioned log with consumer-group offsets.
///
/// Keyed messages hash to a fixed partition, unkeyed ones round-robin.
/// Members of one group split the partitions round-robin in join order and
/// are reassigned whenever a member joins or is dropped; a partition picked
/// up from another member resumes at the group's committed offset.
/// Clones share the same log.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: usize,
    state: Mutex<BrokerState>,
    published: Notify,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<StoredMessage>>>,
    // (group, topic, partition) -> next offset to consume
    committed: HashMap<(String, String, i32), i64>,
    next_unkeyed: usize,
    // (group, topic) -> member ids in join order
    members: HashMap<(String, String), Vec<u64>>,
    next_member: u64,
}

#[derive(Clone)]
struct StoredMessage {
    key: Option<String>,
    payload: Vec<u8>,
}

impl BrokerState {
    fn log(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<StoredMessage>> {
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }

    fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    /// The i-th of n members owns every partition p with p % n == i.
    fn assignment(&self, group: &str, topic: &str, member: u64, partitions: usize) -> Vec<i32> {
        let Some(members) = self.members.get(&(group.to_string(), topic.to_string())) else {
            return Vec::new();
        };
        let Some(index) = members.iter().position(|m| *m == member) else {
            return Vec::new();
        };
        (index..partitions)
            .step_by(members.len())
            .map(|p| p as i32)
            .collect()
    }
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                published: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = SipHasher13::new();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.inner.partitions as u64) as i32
    }

    /// Join `group` on `topic`. The member leaves the group when dropped.
    pub fn subscribe(&self, topic: &str, group: &str) -> MemoryRecordSource {
        let member = {
            let mut state = self.lock();
            state.log(topic, self.inner.partitions);
            let member = state.next_member;
            state.next_member += 1;
            state
                .members
                .entry((group.to_string(), topic.to_string()))
                .or_default()
                .push(member);
            member
        };
        // Existing members re-check their assignment.
        self.inner.published.notify_waiters();

        MemoryRecordSource {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            member,
            positions: BTreeMap::new(),
            cursor: 0,
        }
    }

    fn leave(&self, group: &str, topic: &str, member: u64) {
        {
            let mut state = self.lock();
            if let Some(members) = state
                .members
                .get_mut(&(group.to_string(), topic.to_string()))
            {
                members.retain(|m| *m != member);
            }
        }
        self.inner.published.notify_waiters();
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Every message on the topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.lock();
        let Some(log) = state.logs.get(topic) else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .flat_map(|(partition, messages)| {
                messages.iter().enumerate().map(move |(offset, message)| Record {
                    topic: topic.to_string(),
                    key: message.key.clone(),
                    payload: message.payload.clone(),
                    partition: partition as i32,
                    offset: offset as i64,
                })
            })
            .collect()
    }

    pub fn append(&self, topic: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> (i32, i64) {
        let position = {
            let mut state = self.lock();
            let partition = match key {
                Some(key) => self.partition_for(key) as usize,
                None => {
                    state.next_unkeyed = state.next_unkeyed.wrapping_add(1);
                    state.next_unkeyed % self.inner.partitions
                }
            };
            let log = &mut state.log(topic, self.inner.partitions)[partition];
            log.push(StoredMessage {
                key: key.map(str::to_string),
                payload: payload.into(),
            });
            (partition as i32, log.len() as i64 - 1)
        };
        self.inner.published.notify_waiters();
        position
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<(), TransportError> {
        self.append(topic, key, payload.as_bytes());
        Ok(())
    }
}

pub struct MemoryRecordSource {
    broker: MemoryBroker,
    topic: String,
    group: String,
    member: u64,
    // Next offset to read, per owned partition
    positions: BTreeMap<i32, i64>,
    cursor: usize,
}

impl MemoryRecordSource {
    /// Partitions this member currently owns.
    pub fn assigned_partitions(&self) -> Vec<i32> {
        self.broker.lock().assignment(
            &self.group,
            &self.topic,
            self.member,
            self.broker.partitions(),
        )
    }

    fn poll(&mut self) -> Option<Record> {
        let state = self.broker.lock();
        let owned = state.assignment(
            &self.group,
            &self.topic,
            self.member,
            self.broker.inner.partitions,
        );
        self.positions.retain(|partition, _| owned.contains(partition));
        for partition in &owned {
            self.positions
                .entry(*partition)
                .or_insert_with(|| state.committed_offset(&self.group, &self.topic, *partition));
        }

        let log = state.logs.get(&self.topic)?;
        let count = owned.len();
        for step in 0..count {
            let slot = (self.cursor + step) % count;
            let partition = owned[slot];
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let Some(message) = log[partition as usize].get(position as usize) else {
                continue;
            };
            self.positions.insert(partition, position + 1);
            self.cursor = slot + 1;
            return Some(Record {
                topic: self.topic.clone(),
                key: message.key.clone(),
                payload: message.payload.clone(),
                partition,
                offset: position,
            });
        }
        None
    }

    fn check_partition(&self, record: &Record) -> Result<usize, TransportError> {
        if record.topic != self.topic {
            return Err(TransportError::UnknownTopic(record.topic.clone()));
        }
        usize::try_from(record.partition)
            .ok()
            .filter(|p| *p < self.broker.partitions())
            .ok_or(TransportError::UnknownRecord {
                partition: record.partition,
                offset: record.offset,
            })
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn next(&mut self) -> Result<Record, TransportError> {
        let inner = self.broker.inner.clone();
        loop {
            // Registered before polling so a publish in between is not missed.
            let published = inner.published.notified();
            if let Some(record) = self.poll() {
                return Ok(record);
            }
            published.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<(), TransportError> {
        self.check_partition(record)?;
        let mut state = self.broker.lock();
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone(), record.partition))
            .or_insert(0);
        *committed = (*committed).max(record.offset + 1);
        Ok(())
    }

    /// A partition that moved to another member since the read is left alone;
    /// its new owner starts from the committed offset anyway.
    async fn redeliver(&mut self, record: &Record) -> Result<(), TransportError> {
        self.check_partition(record)?;
        if let Some(position) = self.positions.get_mut(&record.partition) {
            *position = record.offset;
        }
        Ok(())
    }
}

impl Drop for MemoryRecordSource {
    fn drop(&mut self) {
        self.broker.leave(&self.group, &self.topic, self.member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "user_behavior_events";

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition_in_order() {
        let broker = MemoryBroker::new(4);
        for i in 0..3 {
            broker
                .publish(TOPIC, Some("u1"), &format!("{{\"n\":{i}}}"))
                .await
                .unwrap();
        }
        let records = broker.records(TOPIC);
        assert_eq!(records.len(), 3);
        let partition = broker.partition_for("u1");
        assert!(records.iter().all(|r| r.partition == partition));
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_redeliver_and_resume_from_commit() {
        let broker = MemoryBroker::new(1);
        broker.publish(TOPIC, Some("u1"), "a").await.unwrap();
        broker.publish(TOPIC, Some("u1"), "b").await.unwrap();

        let mut source = broker.subscribe(TOPIC, "g1");
        let a = source.next().await.unwrap();
        assert_eq!(a.payload, b"a");
        source.redeliver(&a).await.unwrap();
        let again = source.next().await.unwrap();
        assert_eq!(again, a);
        source.commit(&again).await.unwrap();
        assert_eq!(broker.committed_offset("g1", TOPIC, 0), Some(1));

        // The next member of the group starts after the committed offset.
        drop(source);
        let mut resumed = broker.subscribe(TOPIC, "g1");
        assert_eq!(resumed.next().await.unwrap().payload, b"b");

        // Another group reads from the start.
        let mut other = broker.subscribe(TOPIC, "g2");
        assert_eq!(other.next().await.unwrap().payload, b"a");
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let broker = MemoryBroker::new(4);
        let mut first = broker.subscribe(TOPIC, "g1");
        let mut second = broker.subscribe(TOPIC, "g1");
        assert_eq!(first.assigned_partitions(), vec![0, 2]);
        assert_eq!(second.assigned_partitions(), vec![1, 3]);

        for i in 0..8 {
            broker.publish(TOPIC, None, &i.to_string()).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let record = first.next().await.unwrap();
            assert_eq!(record.partition % 2, 0);
            first.commit(&record).await.unwrap();
            seen.push((record.partition, record.offset));
        }
        for _ in 0..4 {
            let record = second.next().await.unwrap();
            assert_eq!(record.partition % 2, 1);
            seen.push((record.partition, record.offset));
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);

        // The second member never committed, so its partitions replay in full.
        drop(second);
        assert_eq!(first.assigned_partitions(), vec![0, 1, 2, 3]);
        let mut replayed = Vec::new();
        for _ in 0..4 {
            let record = tokio::time::timeout(Duration::from_secs(5), first.next())
                .await
                .expect("timed out")
                .unwrap();
            replayed.push(record.partition);
        }
        replayed.sort();
        assert_eq!(replayed, vec![1, 1, 3, 3]);
    }

    #[tokio::test]
    async fn test_waiting_member_picks_up_partitions_of_a_departed_one() {
        let broker = MemoryBroker::new(2);
        let mut first = broker.subscribe(TOPIC, "g1");
        let second = broker.subscribe(TOPIC, "g1");
        // Partition 1 belongs to the second member.
        broker.append(TOPIC, None, b"only".to_vec());

        let waiter = tokio::spawn(async move { first.next().await.map(|r| r.partition) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(second);

        let partition = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(partition, 1);
    }

    #[tokio::test]
    async fn test_next_waits_for_publish() {
        let broker = MemoryBroker::new(2);
        let mut source = broker.subscribe(TOPIC, "g1");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(TOPIC, None, "late").await.unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(5), source.next())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(record.payload, b"late");
        assert_eq!(record.key, None);
    }

    #[tokio::test]
    async fn test_settling_a_foreign_record_fails() {
        let broker = MemoryBroker::new(1);
        let mut source = broker.subscribe(TOPIC, "g1");
        let foreign = Record {
            topic: "other".to_string(),
            key: None,
            payload: Vec::new(),
            partition: 0,
            offset: 0,
        };
        assert!(matches!(
            source.commit(&foreign).await,
            Err(TransportError::UnknownTopic(_))
        ));
        let out_of_range = Record {
            topic: TOPIC.to_string(),
            partition: 7,
            ..foreign
        };
        assert!(matches!(
            source.redeliver(&out_of_range).await,
            Err(TransportError::UnknownRecord { .. })
        ));
    }
}
