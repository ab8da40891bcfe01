use std::path::Path;
use std::sync::Arc;

use bitcoin::OutPoint;
use rocksdb::{DBCompressionType, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::Serialize;

use crate::arbiter::{RetributionInfo, RetributionStore};
use crate::channel::{ChannelCloseSummary, ChannelStateStore, OpenChannel};
use crate::codec::write_outpoint;
use crate::{Error, Result};

use super::schema::*;

/// The embedded channel database. One RocksDB instance holds the open-
/// channel stubs, close summaries, and retribution checkpoints, keyed by
/// one-byte prefixes.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(DBCompressionType::Lz4);
        let db = Arc::new(DB::open(&options, path)?);
        Ok(Self { db })
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db.get(key.as_ref()).expect("get should be OK")
    }

    fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    /// Point-in-time view of every entry under the prefix.
    fn prefix_entries(&self, prefix: u8) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start = [prefix];
        let snapshot = self.db.snapshot();
        snapshot
            .iterator(IteratorMode::From(&start, Direction::Forward))
            .map(|entry| entry.expect("iterator should be OK"))
            .take_while(|(key, _)| key.first() == Some(&prefix))
            .map(|(key, value)| (key.to_vec(), value.to_vec()))
            .collect()
    }

    fn prefix_is_empty(&self, prefix: u8) -> bool {
        let start = [prefix];
        // Keys are ordered, so the first entry at or after the prefix byte
        // decides.
        self.db
            .iterator(IteratorMode::From(&start, Direction::Forward))
            .next()
            .map(|entry| entry.expect("iterator should be OK"))
            .map_or(true, |(key, _)| key.first() != Some(&prefix))
    }

    /// Record a newly opened channel. Used by the subsystems that own
    /// channel creation; the arbiter only ever reads these.
    pub fn put_open_channel(&self, channel: &OpenChannel) -> Result<()> {
        let mut batch = self.batch();
        batch.put(
            open_channel_key(&channel.chan_point),
            serialize_to_vec(channel, "OpenChannel"),
        );
        batch.commit()
    }

    pub fn get_open_channel(&self, chan_point: &OutPoint) -> Option<OpenChannel> {
        self.get(open_channel_key(chan_point))
            .map(|value| deserialize_from(&value, "OpenChannel"))
    }

    pub fn get_closed_channel(&self, chan_point: &OutPoint) -> Option<ChannelCloseSummary> {
        self.get(closed_channel_key(chan_point))
            .map(|value| deserialize_from(&value, "ChannelCloseSummary"))
    }
}

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} failed: {}", field_name, e))
}

pub(crate) fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> T
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} failed: {}", field_name, e))
}

fn key_with_prefix(prefix: u8, chan_point: &OutPoint) -> Vec<u8> {
    let mut key = vec![prefix];
    write_outpoint(&mut key, chan_point).expect("write outpoint to vec");
    key
}

fn open_channel_key(chan_point: &OutPoint) -> Vec<u8> {
    key_with_prefix(OPEN_CHANNEL_PREFIX, chan_point)
}

fn closed_channel_key(chan_point: &OutPoint) -> Vec<u8> {
    key_with_prefix(CLOSED_CHANNEL_PREFIX, chan_point)
}

fn retribution_key(chan_point: &OutPoint) -> Vec<u8> {
    key_with_prefix(RETRIBUTION_PREFIX, chan_point)
}

pub(crate) struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.wb.put(key, value)
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.wb.delete(key)
    }

    fn commit(self) -> Result<()> {
        self.db.write(self.wb).map_err(Into::into)
    }
}

impl ChannelStateStore for Store {
    fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>> {
        Ok(self
            .prefix_entries(OPEN_CHANNEL_PREFIX)
            .into_iter()
            .map(|(_, value)| deserialize_from(&value, "OpenChannel"))
            .collect())
    }

    fn fetch_closed_channels(&self, pending_only: bool) -> Result<Vec<ChannelCloseSummary>> {
        Ok(self
            .prefix_entries(CLOSED_CHANNEL_PREFIX)
            .into_iter()
            .map(|(_, value)| deserialize_from::<ChannelCloseSummary>(&value, "ChannelCloseSummary"))
            .filter(|summary| !pending_only || summary.is_pending)
            .collect())
    }

    fn close_channel(&self, summary: &ChannelCloseSummary) -> Result<()> {
        let mut batch = self.batch();
        // Deleting an already-absent open record is a no-op, which startup
        // reconciliation relies on being able to repeat.
        batch.delete(open_channel_key(&summary.chan_point));
        batch.put(
            closed_channel_key(&summary.chan_point),
            serialize_to_vec(summary, "ChannelCloseSummary"),
        );
        batch.commit()
    }

    fn mark_channel_fully_closed(&self, chan_point: &OutPoint) -> Result<()> {
        let key = closed_channel_key(chan_point);
        let Some(value) = self.get(&key) else {
            return Err(Error::ChannelNotFound(*chan_point));
        };

        let mut summary: ChannelCloseSummary = deserialize_from(&value, "ChannelCloseSummary");
        summary.is_pending = false;

        let mut batch = self.batch();
        batch.put(key, serialize_to_vec(&summary, "ChannelCloseSummary"));
        batch.commit()
    }
}

impl RetributionStore for Store {
    fn add_retribution(&self, ret: &RetributionInfo) -> Result<()> {
        let mut value = Vec::new();
        ret.encode(&mut value)?;

        let mut batch = self.batch();
        batch.put(retribution_key(&ret.chan_point), value);
        batch.commit()
    }

    fn remove_retribution(&self, chan_point: &OutPoint) -> Result<()> {
        // Normal operation never removes retribution state that was not
        // first recorded; an empty table signals a logic error in the
        // caller.
        if self.prefix_is_empty(RETRIBUTION_PREFIX) {
            return Err(Error::NoRetributions);
        }

        let mut batch = self.batch();
        batch.delete(retribution_key(chan_point));
        batch.commit()
    }

    fn for_all_retributions(
        &self,
        cb: &mut dyn FnMut(RetributionInfo) -> Result<()>,
    ) -> Result<()> {
        for (_, value) in self.prefix_entries(RETRIBUTION_PREFIX) {
            let ret = RetributionInfo::decode(&mut value.as_slice())?;
            cb(ret)?;
        }
        Ok(())
    }
}
