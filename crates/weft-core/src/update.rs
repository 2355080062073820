//! The columnar update format.
//!
//! An update is written as a feature byte, nine length-prefixed column
//! streams and a trailing "rest" stream:
//!
//! | Column      | Codec            | Carries                         |
//! |-------------|------------------|---------------------------------|
//! | key clock   | IntDiffOptRle    | format key references           |
//! | client      | UintOptRle       | client ids                      |
//! | left clock  | IntDiffOptRle    | origin and parent clocks        |
//! | right clock | IntDiffOptRle    | right origin clocks             |
//! | info        | Rle              | content ref and origin flags    |
//! | string      | string table     | text, keys, root names          |
//! | parent info | Rle              | root-name vs. item parent       |
//! | type ref    | UintOptRle       | nested type kinds               |
//! | len         | UintOptRle       | content lengths                 |
//!
//! The rest stream holds the struct and delete-set framing, `Any` values and
//! binary buffers.

use crate::block::{Block, Gc, Item, Parent};
use crate::branch::TypePtr;
use crate::content::ItemContent;
use crate::delete_set::DeleteSet;
use crate::error::{Error, Result};
use crate::id::{ClientId, StateVector, ID};
use crate::store::Store;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;
use weft_codec::{
    Any, Decoder, Encoder, IntDiffOptRleDecoder, IntDiffOptRleEncoder, RleDecoder, RleEncoder,
    StringDecoder, StringEncoder, UintOptRleDecoder, UintOptRleEncoder,
};

pub(crate) const BLOCK_GC: u8 = 0;
pub(crate) const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0x80;
const HAS_RIGHT_ORIGIN: u8 = 0x40;
const HAS_PARENT_SUB: u8 = 0x20;
const CONTENT_REF_MASK: u8 = 0x1F;

pub struct UpdateEncoderV2 {
    pub(crate) rest: Encoder,
    key_clock: IntDiffOptRleEncoder,
    next_key_clock: i64,
    client: UintOptRleEncoder,
    left_clock: IntDiffOptRleEncoder,
    right_clock: IntDiffOptRleEncoder,
    info: RleEncoder,
    string: StringEncoder,
    parent_info: RleEncoder,
    type_ref: UintOptRleEncoder,
    len: UintOptRleEncoder,
    ds_curr_val: u64,
}

impl Default for UpdateEncoderV2 {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateEncoderV2 {
    pub fn new() -> Self {
        Self {
            rest: Encoder::new(),
            key_clock: IntDiffOptRleEncoder::new(),
            next_key_clock: 0,
            client: UintOptRleEncoder::new(),
            left_clock: IntDiffOptRleEncoder::new(),
            right_clock: IntDiffOptRleEncoder::new(),
            info: RleEncoder::new(),
            string: StringEncoder::new(),
            parent_info: RleEncoder::new(),
            type_ref: UintOptRleEncoder::new(),
            len: UintOptRleEncoder::new(),
            ds_curr_val: 0,
        }
    }

    pub(crate) fn write_left_id(&mut self, id: &ID) {
        self.client.write(id.client);
        self.left_clock.write(id.clock as i64);
    }

    pub(crate) fn write_right_id(&mut self, id: &ID) {
        self.client.write(id.client);
        self.right_clock.write(id.clock as i64);
    }

    pub(crate) fn write_client(&mut self, client: ClientId) {
        self.client.write(client);
    }

    pub(crate) fn write_info(&mut self, info: u8) {
        self.info.write(info);
    }

    pub(crate) fn write_string(&mut self, s: &str) {
        self.string.write(s);
    }

    pub(crate) fn write_parent_info(&mut self, is_root_name: bool) {
        self.parent_info.write(u8::from(is_root_name));
    }

    pub(crate) fn write_type_ref(&mut self, type_ref: u64) {
        self.type_ref.write(type_ref);
    }

    pub(crate) fn write_len(&mut self, len: u64) {
        self.len.write(len);
    }

    pub(crate) fn write_any(&mut self, value: &Any) {
        value.encode(&mut self.rest);
    }

    pub(crate) fn write_buf(&mut self, buf: &[u8]) {
        self.rest.write_var_buf(buf);
    }

    pub(crate) fn write_json(&mut self, value: &Any) {
        value.encode(&mut self.rest);
    }

    /// Keys are always written in full; readers still accept references to
    /// earlier keys.
    pub(crate) fn write_key(&mut self, key: &str) {
        self.key_clock.write(self.next_key_clock);
        self.next_key_clock += 1;
        self.string.write(key);
    }

    pub(crate) fn reset_ds_cur_val(&mut self) {
        self.ds_curr_val = 0;
    }

    pub(crate) fn write_ds_clock(&mut self, clock: u64) {
        let diff = clock - self.ds_curr_val;
        self.ds_curr_val = clock;
        self.rest.write_var_u64(diff);
    }

    pub(crate) fn write_ds_len(&mut self, len: u64) {
        debug_assert!(len > 0, "empty delete range");
        self.rest.write_var_u64(len - 1);
        self.ds_curr_val += len;
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Encoder::with_capacity(self.rest.len() + 64);
        out.write_var_u64(0);
        out.write_var_buf(&self.key_clock.finish());
        out.write_var_buf(&self.client.finish());
        out.write_var_buf(&self.left_clock.finish());
        out.write_var_buf(&self.right_clock.finish());
        out.write_var_buf(&self.info.finish());
        out.write_var_buf(&self.string.finish());
        out.write_var_buf(&self.parent_info.finish());
        out.write_var_buf(&self.type_ref.finish());
        out.write_var_buf(&self.len.finish());
        out.write_bytes(self.rest.as_slice());
        out.into_vec()
    }
}

pub struct UpdateDecoderV2<'a> {
    pub(crate) rest: Decoder<'a>,
    keys: Vec<Arc<str>>,
    key_clock: IntDiffOptRleDecoder<'a>,
    client: UintOptRleDecoder<'a>,
    left_clock: IntDiffOptRleDecoder<'a>,
    right_clock: IntDiffOptRleDecoder<'a>,
    info: RleDecoder<'a>,
    string: StringDecoder<'a>,
    parent_info: RleDecoder<'a>,
    type_ref: UintOptRleDecoder<'a>,
    len: UintOptRleDecoder<'a>,
    ds_curr_val: u64,
}

impl<'a> UpdateDecoderV2<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        // feature flag, unused
        dec.read_var_u64()?;
        let key_clock = IntDiffOptRleDecoder::new(dec.read_var_buf()?);
        let client = UintOptRleDecoder::new(dec.read_var_buf()?);
        let left_clock = IntDiffOptRleDecoder::new(dec.read_var_buf()?);
        let right_clock = IntDiffOptRleDecoder::new(dec.read_var_buf()?);
        let info = RleDecoder::new(dec.read_var_buf()?);
        let string = StringDecoder::new(dec.read_var_buf()?)?;
        let parent_info = RleDecoder::new(dec.read_var_buf()?);
        let type_ref = UintOptRleDecoder::new(dec.read_var_buf()?);
        let len = UintOptRleDecoder::new(dec.read_var_buf()?);
        Ok(Self {
            rest: dec,
            keys: Vec::new(),
            key_clock,
            client,
            left_clock,
            right_clock,
            info,
            string,
            parent_info,
            type_ref,
            len,
            ds_curr_val: 0,
        })
    }

    fn read_clock(value: i64) -> Result<u64> {
        u64::try_from(value).map_err(|_| Error::InvalidUpdate(format!("negative clock {value}")))
    }

    pub(crate) fn read_left_id(&mut self) -> Result<ID> {
        let client = self.client.read()?;
        let clock = Self::read_clock(self.left_clock.read()?)?;
        Ok(ID::new(client, clock))
    }

    pub(crate) fn read_right_id(&mut self) -> Result<ID> {
        let client = self.client.read()?;
        let clock = Self::read_clock(self.right_clock.read()?)?;
        Ok(ID::new(client, clock))
    }

    pub(crate) fn read_client(&mut self) -> Result<ClientId> {
        Ok(self.client.read()?)
    }

    pub(crate) fn read_info(&mut self) -> Result<u8> {
        Ok(self.info.read()?)
    }

    pub(crate) fn read_string(&mut self) -> Result<&'a str> {
        Ok(self.string.read()?)
    }

    pub(crate) fn read_parent_info(&mut self) -> Result<bool> {
        Ok(self.parent_info.read()? == 1)
    }

    pub(crate) fn read_type_ref(&mut self) -> Result<u64> {
        Ok(self.type_ref.read()?)
    }

    pub(crate) fn read_len(&mut self) -> Result<u64> {
        Ok(self.len.read()?)
    }

    pub(crate) fn read_any(&mut self) -> Result<Any> {
        Ok(Any::decode(&mut self.rest)?)
    }

    pub(crate) fn read_buf(&mut self) -> Result<&'a [u8]> {
        Ok(self.rest.read_var_buf()?)
    }

    pub(crate) fn read_json(&mut self) -> Result<Any> {
        self.read_any()
    }

    pub(crate) fn read_key(&mut self) -> Result<Arc<str>> {
        let clock = self.key_clock.read()?;
        if let Some(key) = usize::try_from(clock).ok().and_then(|i| self.keys.get(i)) {
            return Ok(key.clone());
        }
        let key: Arc<str> = self.string.read()?.into();
        self.keys.push(key.clone());
        Ok(key)
    }

    pub(crate) fn reset_ds_cur_val(&mut self) {
        self.ds_curr_val = 0;
    }

    pub(crate) fn read_ds_clock(&mut self) -> Result<u64> {
        let diff = self.rest.read_var_u64()?;
        self.ds_curr_val = self
            .ds_curr_val
            .checked_add(diff)
            .ok_or_else(|| Error::InvalidUpdate("delete set clock overflow".into()))?;
        Ok(self.ds_curr_val)
    }

    pub(crate) fn read_ds_len(&mut self) -> Result<u64> {
        let len = self
            .rest
            .read_var_u64()?
            .checked_add(1)
            .ok_or_else(|| Error::InvalidUpdate("delete set length overflow".into()))?;
        // the range end must stay addressable
        self.ds_curr_val = self
            .ds_curr_val
            .checked_add(len)
            .ok_or_else(|| Error::InvalidUpdate("delete set range overflow".into()))?;
        Ok(len)
    }
}

/// A decoded update: blocks grouped by client plus the deletions it carries.
#[derive(Debug, Default)]
pub struct Update {
    pub(crate) blocks: HashMap<ClientId, VecDeque<Block>>,
    pub(crate) delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(VecDeque::is_empty) && self.delete_set.is_empty()
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.delete_set
    }

    /// Next clock per client once this update is integrated.
    pub fn state_vector(&self) -> StateVector {
        self.blocks
            .iter()
            .filter_map(|(client, blocks)| {
                let last = blocks.back()?;
                Some((*client, last.id().clock + last.len()))
            })
            .collect()
    }

    /// Number of blocks carried.
    pub fn block_count(&self) -> usize {
        self.blocks.values().map(VecDeque::len).sum()
    }

    pub fn decode_v2(bytes: &[u8]) -> Result<Self> {
        let mut dec = UpdateDecoderV2::new(bytes)?;
        let blocks = read_client_blocks(&mut dec)?;
        let delete_set = DeleteSet::decode(&mut dec)?;
        Ok(Self { blocks, delete_set })
    }

    pub fn encode_v2(&self) -> Vec<u8> {
        let mut enc = UpdateEncoderV2::new();
        write_detached_blocks(&mut enc, &self.blocks, None);
        self.delete_set.encode(&mut enc);
        enc.finish()
    }
}

fn read_client_blocks(dec: &mut UpdateDecoderV2<'_>) -> Result<HashMap<ClientId, VecDeque<Block>>> {
    let mut result = HashMap::new();
    let num_clients = dec.rest.read_len()?;
    for _ in 0..num_clients {
        let num_blocks = dec.rest.read_len()?;
        let client = dec.read_client()?;
        let mut clock = dec.rest.read_var_u64()?;
        let mut blocks = VecDeque::with_capacity(num_blocks.min(1024));
        for _ in 0..num_blocks {
            let info = dec.read_info()?;
            let id = ID::new(client, clock);
            let len = match info & CONTENT_REF_MASK {
                BLOCK_GC => {
                    let len = dec.read_len()?;
                    if len == 0 {
                        return Err(Error::InvalidUpdate(format!("empty gc range at {id}")));
                    }
                    blocks.push_back(Block::Gc(Gc { id, len }));
                    len
                }
                BLOCK_SKIP => dec.rest.read_var_u64()?,
                content_ref => {
                    let item = read_item(dec, id, info, content_ref)?;
                    let len = item.len;
                    blocks.push_back(Block::Item(item));
                    len
                }
            };
            clock = clock
                .checked_add(len)
                .ok_or_else(|| Error::InvalidUpdate(format!("clock overflow for client {client}")))?;
        }
        if !blocks.is_empty() {
            result.insert(client, blocks);
        }
    }
    Ok(result)
}

fn read_item(dec: &mut UpdateDecoderV2<'_>, id: ID, info: u8, content_ref: u8) -> Result<Item> {
    let origin = if info & HAS_ORIGIN != 0 {
        Some(dec.read_left_id()?)
    } else {
        None
    };
    let right_origin = if info & HAS_RIGHT_ORIGIN != 0 {
        Some(dec.read_right_id()?)
    } else {
        None
    };
    let (parent, parent_sub) = if origin.is_none() && right_origin.is_none() {
        let parent = if dec.read_parent_info()? {
            Parent::Named(dec.read_string()?.into())
        } else {
            Parent::Id(dec.read_left_id()?)
        };
        let parent_sub = if info & HAS_PARENT_SUB != 0 {
            Some(Arc::from(dec.read_string()?))
        } else {
            None
        };
        (parent, parent_sub)
    } else {
        (Parent::Unknown, None)
    };
    let content = ItemContent::decode(dec, content_ref)?;
    let item = Item::new(id, None, origin, None, right_origin, parent, parent_sub, content);
    if item.len == 0 {
        return Err(Error::InvalidUpdate(format!("empty item at {id}")));
    }
    Ok(item)
}

/// Write one block starting at element `offset`. Items whose parent is a
/// live type need `store` to name it on the wire.
pub(crate) fn write_block(enc: &mut UpdateEncoderV2, block: &Block, offset: u64, store: Option<&Store>) {
    match block {
        Block::Gc(gc) => {
            enc.write_info(BLOCK_GC);
            enc.write_len(gc.len - offset);
        }
        Block::Item(item) => write_item(enc, item, offset, store),
    }
}

fn write_item(enc: &mut UpdateEncoderV2, item: &Item, offset: u64, store: Option<&Store>) {
    let origin = if offset > 0 {
        Some(ID::new(item.id.client, item.id.clock + offset - 1))
    } else {
        item.origin
    };
    let mut info = item.content.content_ref() & CONTENT_REF_MASK;
    if origin.is_some() {
        info |= HAS_ORIGIN;
    }
    if item.right_origin.is_some() {
        info |= HAS_RIGHT_ORIGIN;
    }
    if item.parent_sub.is_some() {
        info |= HAS_PARENT_SUB;
    }
    enc.write_info(info);
    if let Some(origin) = &origin {
        enc.write_left_id(origin);
    }
    if let Some(right_origin) = &item.right_origin {
        enc.write_right_id(right_origin);
    }
    if origin.is_none() && item.right_origin.is_none() {
        write_parent(enc, &item.parent, store);
        if let Some(sub) = &item.parent_sub {
            enc.write_string(sub);
        }
    }
    item.content.encode(enc, offset);
}

fn write_parent(enc: &mut UpdateEncoderV2, parent: &Parent, store: Option<&Store>) {
    match parent {
        Parent::Named(name) => {
            enc.write_parent_info(true);
            enc.write_string(name);
        }
        Parent::Id(id) => {
            enc.write_parent_info(false);
            enc.write_left_id(id);
        }
        Parent::Type(TypePtr::Root(index)) => {
            let name = store.and_then(|s| s.root_name(*index)).map(|n| &**n);
            enc.write_parent_info(true);
            enc.write_string(name.unwrap_or_default());
        }
        Parent::Type(TypePtr::Nested(ptr)) => {
            let id = store.map_or(ID::new(0, 0), |s| s.block(*ptr).id());
            enc.write_parent_info(false);
            enc.write_left_id(&id);
        }
        Parent::Unknown => {
            warn!("writing an item without origins or parent");
            enc.write_parent_info(true);
            enc.write_string("");
        }
    }
}

/// Write blocks that are not part of a store (decoded or pending), filling
/// clock gaps with skip ranges.
pub(crate) fn write_detached_blocks(
    enc: &mut UpdateEncoderV2,
    blocks: &HashMap<ClientId, VecDeque<Block>>,
    store: Option<&Store>,
) {
    let mut clients: Vec<_> = blocks.iter().filter(|(_, b)| !b.is_empty()).collect();
    clients.sort_unstable_by(|a, b| b.0.cmp(a.0));
    enc.rest.write_var_u64(clients.len() as u64);
    for (client, blocks) in clients {
        let mut expected = blocks.front().map(|b| b.id().clock).unwrap_or(0);
        let gaps = blocks
            .iter()
            .scan(expected, |next, block| {
                let gap = block.id().clock > *next;
                *next = block.id().clock + block.len();
                Some(gap)
            })
            .filter(|gap| *gap)
            .count();
        enc.rest.write_var_u64((blocks.len() + gaps) as u64);
        enc.write_client(*client);
        enc.rest.write_var_u64(expected);
        for block in blocks {
            let clock = block.id().clock;
            if clock > expected {
                enc.write_info(BLOCK_SKIP);
                enc.rest.write_var_u64(clock - expected);
            }
            write_block(enc, block, 0, store);
            expected = clock + block.len();
        }
    }
}

/// Write every block of `store` that `sv` has not seen yet.
pub(crate) fn write_store_blocks(enc: &mut UpdateEncoderV2, store: &Store, sv: &StateVector) {
    let mut clients: Vec<(ClientId, u64)> = store
        .clients()
        .map(|client| (client, sv.get(client)))
        .filter(|(client, clock)| store.get_state(*client) > *clock)
        .collect();
    clients.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    enc.rest.write_var_u64(clients.len() as u64);
    for (client, clock) in clients {
        let blocks = store.blocks_of(client);
        let Some(start) = store.find_index(client, clock) else {
            continue;
        };
        enc.rest.write_var_u64((blocks.len() - start) as u64);
        enc.write_client(client);
        enc.rest.write_var_u64(clock);
        let first = store.block(blocks[start]);
        write_block(enc, first, clock - first.id().clock, Some(store));
        for ptr in &blocks[start + 1..] {
            write_block(enc, store.block(*ptr), 0, Some(store));
        }
    }
}

/// Full update bringing a replica at `sv` up to date with `store`.
pub fn encode_state_as_update(store: &Store, sv: &StateVector) -> Vec<u8> {
    let mut enc = UpdateEncoderV2::new();
    write_store_blocks(&mut enc, store, sv);
    DeleteSet::from_store(store).encode(&mut enc);
    enc.finish()
}
