//! An in-memory key-value server speaking a length-prefixed binary protocol
//! over TCP. A single poll-based event loop serves every connection; the
//! keyspace is a chaining hash map with incremental rehashing, and sorted
//! sets keep a second index in a height-balanced tree with subtree counts
//! so rank queries stay logarithmic.
//!
//! Run with no arguments to start the server on port 1234, or
//! `minikv client CMD [ARG...]` to issue a single command against it.

/* imports */
use std::collections::{HashMap, VecDeque};
use std::env;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use ordered_float::OrderedFloat;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/* constants */
const SERVER_PORT: u16 = 1234;
const BACKLOG: i32 = 128;

/// Upper bound for a single request or response body.
const K_MAX_MSG: usize = 32 << 20;
/// Upper bound for the number of strings in one request.
const K_MAX_ARGS: usize = 1 << 20;

/// Maximum load factor for the chaining hash tables. A value > 1 is fine
/// because a bucket holds a list, not a single slot.
const K_MAX_LOAD_FACTOR: usize = 8;
/// Nodes migrated from the older table per hash map operation.
const K_REHASHING_WORK: usize = 128;

const K_IDLE_TIMEOUT_MS: u64 = 5_000;
/// Cap on expired keys reaped in one timer pass.
const K_MAX_WORKS: usize = 2_000;
/// Sorted sets larger than this are handed to the worker pool for disposal.
const K_LARGE_CONTAINER_SIZE: usize = 1_000;
const NUM_WORKER_THREADS: usize = 4;

/* protocol types */

/// Error codes carried inside an ERR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ErrCode {
    /// Unrecognized command or wrong arity.
    Unknown = 1,
    /// The key exists but holds a value of another type.
    BadTyp = 2,
    /// A numeric argument failed to parse, or is NaN.
    BadArg = 3,
    /// The response would exceed `K_MAX_MSG`.
    TooBig = 4,
}

/// One-byte type discriminator preceding every serialized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

impl Tag {
    fn from_u8(b: u8) -> Result<Tag, ProtocolError> {
        match b {
            0 => Ok(Tag::Nil),
            1 => Ok(Tag::Err),
            2 => Ok(Tag::Str),
            3 => Ok(Tag::Int),
            4 => Ok(Tag::Dbl),
            5 => Ok(Tag::Arr),
            other => Err(ProtocolError::BadTag(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ProtocolError {
    #[error("truncated message")]
    Truncated,
    #[error("too many arguments in request")]
    TooManyArgs,
    #[error("trailing garbage after message")]
    TrailingGarbage,
    #[error("unknown value tag {0}")]
    BadTag(u8),
}

/* byte buffer */

/// FIFO byte buffer doubling as the wire serializer: tagged values are
/// written straight into it and length prefixes are patched in place once
/// a frame or array is complete.
///
/// Appends go through the backing `Vec`; consuming only advances `start`,
/// so pulling parsed requests off the front is O(1). The consumed prefix
/// is reclaimed once it outweighs the live bytes, which keeps the
/// relative positions handed out by `begin_response`/`begin_arr` valid:
/// live bytes never change order, only their offset from zero.
#[derive(Debug, Default)]
struct Buffer {
    data: Vec<u8>,
    start: usize, // everything before this has been consumed
}

impl Buffer {
    fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> &[u8] {
        &self.data[self.start..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.data.len()
    }

    fn append(&mut self, bytes: &[u8]) {
        self.reclaim();
        self.data.extend_from_slice(bytes);
    }

    /// Remove `n` bytes from the front.
    fn consume(&mut self, n: usize) {
        assert!(n <= self.len());
        self.start += n;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// Shift the live bytes down before growing the buffer any further.
    /// Only worth doing once the dead prefix dominates.
    fn reclaim(&mut self) {
        if self.start >= 4096 && self.start > self.data.len() / 2 {
            self.data.copy_within(self.start.., 0);
            let live = self.data.len() - self.start;
            self.data.truncate(live);
            self.start = 0;
        }
    }

    fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    fn append_i64(&mut self, v: i64) {
        self.append(&v.to_le_bytes());
    }

    fn append_f64(&mut self, v: f64) {
        self.append(&v.to_le_bytes());
    }

    /// Overwrite 4 bytes at a live-data position with a little-endian
    /// count or length.
    fn patch_u32(&mut self, pos: usize, v: u32) {
        self.data[self.start + pos..self.start + pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /* tagged value serialization */

    fn write_nil(&mut self) {
        self.append_u8(Tag::Nil as u8);
    }

    fn write_err(&mut self, code: ErrCode, msg: &str) {
        self.append_u8(Tag::Err as u8);
        self.append_u32(code as u32);
        self.append_u32(msg.len() as u32);
        self.append(msg.as_bytes());
    }

    fn write_str(&mut self, s: &[u8]) {
        self.append_u8(Tag::Str as u8);
        self.append_u32(s.len() as u32);
        self.append(s);
    }

    fn write_int(&mut self, val: i64) {
        self.append_u8(Tag::Int as u8);
        self.append_i64(val);
    }

    fn write_dbl(&mut self, val: f64) {
        self.append_u8(Tag::Dbl as u8);
        self.append_f64(val);
    }

    fn write_arr(&mut self, n: u32) {
        self.append_u8(Tag::Arr as u8);
        self.append_u32(n);
    }

    /// Emit an ARR tag with a placeholder count; returns the count
    /// position for `end_arr`. Nests freely.
    fn begin_arr(&mut self) -> usize {
        self.append_u8(Tag::Arr as u8);
        let ctx = self.len();
        self.append_u32(0);
        ctx
    }

    fn end_arr(&mut self, ctx: usize, n: u32) {
        assert_eq!(self.data[self.start + ctx - 1], Tag::Arr as u8);
        self.patch_u32(ctx, n);
    }

    /// Reserve the 4-byte frame header; returns its position for
    /// `end_response`.
    fn begin_response(&mut self) -> usize {
        let header = self.len();
        self.append_u32(0);
        header
    }

    /// Patch the reserved header with the final body size. An oversized
    /// body is thrown away and replaced with ERR(TooBig).
    fn end_response(&mut self, header: usize) {
        let mut body = self.len() - header - 4;
        if body > K_MAX_MSG {
            self.data.truncate(self.start + header + 4);
            self.write_err(ErrCode::TooBig, "response is too big");
            body = self.len() - header - 4;
        }
        self.patch_u32(header, body as u32);
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/* request parsing */

fn read_u8(cur: &mut &[u8]) -> Result<u8, ProtocolError> {
    let (&b, rest) = cur.split_first().ok_or(ProtocolError::Truncated)?;
    *cur = rest;
    Ok(b)
}

fn read_u32(cur: &mut &[u8]) -> Result<u32, ProtocolError> {
    if cur.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let (head, rest) = cur.split_at(4);
    *cur = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

fn read_i64(cur: &mut &[u8]) -> Result<i64, ProtocolError> {
    if cur.len() < 8 {
        return Err(ProtocolError::Truncated);
    }
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok(i64::from_le_bytes(raw))
}

fn read_f64(cur: &mut &[u8]) -> Result<f64, ProtocolError> {
    if cur.len() < 8 {
        return Err(ProtocolError::Truncated);
    }
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok(f64::from_le_bytes(raw))
}

/// Read exactly `n` bytes, advancing the cursor by `n`.
fn read_str(cur: &mut &[u8], n: usize) -> Result<Vec<u8>, ProtocolError> {
    if cur.len() < n {
        return Err(ProtocolError::Truncated);
    }
    let (head, rest) = cur.split_at(n);
    *cur = rest;
    Ok(head.to_vec())
}

/// A request body is a list of length-prefixed strings:
///
/// ```text
/// +------+-----+------+-----+------+-----+-----+------+
/// | nstr | len | str1 | len | str2 | ... | len | strn |
/// +------+-----+------+-----+------+-----+-----+------+
///    4B     4B    ...    4B   ...
/// ```
///
/// Rejects an oversized string count, any short read, and trailing bytes
/// after the last string.
fn parse_req(data: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut cur = data;
    let nstr = read_u32(&mut cur)? as usize;
    if nstr > K_MAX_ARGS {
        return Err(ProtocolError::TooManyArgs);
    }

    let mut out = Vec::new();
    while out.len() < nstr {
        let len = read_u32(&mut cur)? as usize;
        out.push(read_str(&mut cur, len)?);
    }

    if !cur.is_empty() {
        return Err(ProtocolError::TrailingGarbage);
    }
    Ok(out)
}

/// A deserialized response value. The server never builds these; the
/// client (and the tests) use them to decode what came off the wire.
#[derive(Debug, Clone, PartialEq)]
enum RedisValue {
    Nil,
    Err(u32, String),
    Str(Vec<u8>),
    Int(i64),
    Dbl(f64),
    Arr(Vec<RedisValue>),
}

impl RedisValue {
    fn parse(cur: &mut &[u8]) -> Result<RedisValue, ProtocolError> {
        match Tag::from_u8(read_u8(cur)?)? {
            Tag::Nil => Ok(RedisValue::Nil),
            Tag::Err => {
                let code = read_u32(cur)?;
                let len = read_u32(cur)? as usize;
                let msg = read_str(cur, len)?;
                Ok(RedisValue::Err(
                    code,
                    String::from_utf8_lossy(&msg).into_owned(),
                ))
            }
            Tag::Str => {
                let len = read_u32(cur)? as usize;
                Ok(RedisValue::Str(read_str(cur, len)?))
            }
            Tag::Int => Ok(RedisValue::Int(read_i64(cur)?)),
            Tag::Dbl => Ok(RedisValue::Dbl(read_f64(cur)?)),
            Tag::Arr => {
                let n = read_u32(cur)?;
                let mut items = Vec::new();
                for _ in 0..n {
                    items.push(RedisValue::parse(cur)?);
                }
                Ok(RedisValue::Arr(items))
            }
        }
    }
}

impl fmt::Display for RedisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisValue::Nil => write!(f, "(nil)"),
            RedisValue::Err(code, msg) => write!(f, "(err) {code} {msg}"),
            RedisValue::Str(s) => write!(f, "\"{}\"", String::from_utf8_lossy(s)),
            RedisValue::Int(v) => write!(f, "(int) {v}"),
            RedisValue::Dbl(v) => write!(f, "(dbl) {v}"),
            RedisValue::Arr(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/* numeric argument parsing */

/// Parse a float argument; NaN is not a valid score.
fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let v: f64 = s.parse().ok()?;
    (!v.is_nan()).then_some(v)
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/* worker thread pool */

/// Background work shipped off the event loop. Disposal is the only job:
/// dropping a detached entry is O(N) when it holds a large sorted set,
/// and none of it needs the live keyspace.
enum Work {
    Dispose(Box<Entry>),
}

impl Work {
    fn run(self) {
        match self {
            Work::Dispose(entry) => drop(entry),
        }
    }
}

struct WorkQueue {
    jobs: VecDeque<Work>,
    shutdown: bool,
}

/// Fixed set of consumer threads behind one queue. Producers push under
/// the mutex and the condvar signals not-empty; a worker runs each job
/// with the lock released. Work still queued at shutdown is drained
/// before the workers exit.
struct ThreadPool {
    threads: Vec<thread::JoinHandle<()>>,
    queue: Arc<(Mutex<WorkQueue>, Condvar)>,
}

fn worker_loop(queue: &(Mutex<WorkQueue>, Condvar)) {
    let (lock, cvar) = queue;
    let mut q = lock.lock().unwrap();
    loop {
        if let Some(job) = q.jobs.pop_front() {
            drop(q);
            job.run();
            q = lock.lock().unwrap();
        } else if q.shutdown {
            return;
        } else {
            q = cvar.wait(q).unwrap();
        }
    }
}

impl ThreadPool {
    fn new(num_threads: usize) -> Self {
        let queue = Arc::new((
            Mutex::new(WorkQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let threads = (0..num_threads)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || worker_loop(&queue))
            })
            .collect();

        Self { threads, queue }
    }

    fn submit(&self, work: Work) {
        let (lock, cvar) = &*self.queue;
        lock.lock().unwrap().jobs.push_back(work);
        cvar.notify_one();
    }

    /// Let the workers drain whatever is queued, then join them.
    fn shutdown(self) {
        let (lock, cvar) = &*self.queue;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/* monotonic clock */

/// Monotonic milliseconds since process start. Only used to measure
/// durations, never related to wall-clock time.
fn get_monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/* idle connection list */

type DListRef = Arc<Mutex<DListNode>>;

/// Node of the circular doubly-linked idle list. The dummy head carries
/// fd -1; every other node names the connection it belongs to, ordered by
/// last activity (least recent at the front).
struct DListNode {
    prev: Option<DListRef>,
    next: Option<DListRef>,
    fd: RawFd,
}

fn dlist_new(fd: RawFd) -> DListRef {
    Arc::new(Mutex::new(DListNode {
        prev: None,
        next: None,
        fd,
    }))
}

/// The dummy head is linked to itself, forming a circle, so insertion
/// never needs to handle the empty case.
fn dlist_init(head: &DListRef) {
    let mut node = head.lock().unwrap();
    node.prev = Some(Arc::clone(head));
    node.next = Some(Arc::clone(head));
}

/// An empty list is a list holding only the dummy head.
fn dlist_empty(head: &DListRef) -> bool {
    let node = head.lock().unwrap();
    match &node.next {
        Some(next) => Arc::ptr_eq(head, next),
        None => true,
    }
}

fn dlist_detach(node: &DListRef) {
    let (prev, next) = {
        let n = node.lock().unwrap();
        (n.prev.clone(), n.next.clone())
    };
    if let Some(prev) = &prev {
        prev.lock().unwrap().next = next.clone();
    }
    if let Some(next) = &next {
        next.lock().unwrap().prev = prev;
    }
    let mut n = node.lock().unwrap();
    n.prev = None;
    n.next = None;
}

fn dlist_insert_before(target: &DListRef, rookie: &DListRef) {
    let prev = {
        let t = target.lock().unwrap();
        t.prev.clone().expect("target must be linked")
    };
    prev.lock().unwrap().next = Some(Arc::clone(rookie));
    {
        let mut r = rookie.lock().unwrap();
        r.prev = Some(prev);
        r.next = Some(Arc::clone(target));
    }
    target.lock().unwrap().prev = Some(Arc::clone(rookie));
}

/* ttl heap */

/// Min-heap item: a deadline paired with the key it expires. Items are
/// never removed in place; a stale item (the key's live deadline moved or
/// vanished) is discarded when it reaches the root.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapItem {
    val: u64,
    key: Vec<u8>,
}

fn heap_left(i: usize) -> usize {
    i * 2 + 1
}

fn heap_right(i: usize) -> usize {
    i * 2 + 2
}

fn heap_parent(i: usize) -> usize {
    (i - 1) / 2
}

fn heap_up(a: &mut [HeapItem], mut pos: usize) {
    while pos > 0 && a[heap_parent(pos)].val > a[pos].val {
        a.swap(pos, heap_parent(pos));
        pos = heap_parent(pos);
    }
}

fn heap_down(a: &mut [HeapItem], mut pos: usize) {
    let len = a.len();
    loop {
        let l = heap_left(pos);
        let r = heap_right(pos);
        let mut min_pos = pos;
        if l < len && a[l].val < a[min_pos].val {
            min_pos = l;
        }
        if r < len && a[r].val < a[min_pos].val {
            min_pos = r;
        }
        if min_pos == pos {
            return;
        }
        a.swap(pos, min_pos);
        pos = min_pos;
    }
}

fn heap_push(heap: &mut Vec<HeapItem>, item: HeapItem) {
    heap.push(item);
    let last_idx = heap.len() - 1;
    heap_up(heap, last_idx);
}

fn heap_pop_min(heap: &mut Vec<HeapItem>) -> Option<HeapItem> {
    let last = heap.pop()?;
    if heap.is_empty() {
        return Some(last);
    }
    let min = std::mem::replace(&mut heap[0], last);
    heap_down(heap, 0);
    Some(min)
}

/* hash map */

/// FNV-1a style hash over the key bytes. Collisions on the 64-bit code
/// are resolved by the full key comparison in the bucket walk.
fn hash_key(data: &[u8]) -> u64 {
    let mut h: u64 = 0x811c_9dc5;
    for &b in data {
        h = h.wrapping_add(b as u64).wrapping_mul(0x0100_0193);
    }
    h
}

/// A value stored under a key: either a byte string or a sorted set.
enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
}

/// One keyspace record. The intrusive `link` threads it into a bucket
/// chain; a record is in exactly one chain at a time.
struct Entry {
    link: LinkedListLink,
    hcode: u64,
    key: Vec<u8>,
    value: Value,
}

impl Entry {
    fn new(key: Vec<u8>, value: Value) -> Self {
        let hcode = hash_key(&key);
        Self {
            link: LinkedListLink::new(),
            hcode,
            key,
            value,
        }
    }
}

intrusive_adapter!(EntryAdapter = Box<Entry>: Entry { link: LinkedListLink });

/// Fixed-size chaining hash table; bucket count is a power of two so the
/// index is `hcode & mask`.
struct HashTable {
    tab: Vec<LinkedList<EntryAdapter>>,
    mask: usize,
    size: usize,
}

impl HashTable {
    fn new(n: usize) -> Self {
        assert!(n.is_power_of_two());
        let tab = (0..n)
            .map(|_| LinkedList::new(EntryAdapter::new()))
            .collect();
        Self {
            tab,
            mask: n - 1,
            size: 0,
        }
    }

    fn insert(&mut self, entry: Box<Entry>) {
        let pos = (entry.hcode as usize) & self.mask;
        self.tab[pos].push_front(entry);
        self.size += 1;
    }

    fn lookup<F>(&self, hcode: u64, eq: &F) -> Option<&Entry>
    where
        F: Fn(&Entry) -> bool,
    {
        let pos = (hcode as usize) & self.mask;
        self.tab[pos]
            .iter()
            .find(|ent| ent.hcode == hcode && eq(ent))
    }

    /// Detach and return the matching entry, if any.
    fn take<F>(&mut self, hcode: u64, eq: &F) -> Option<Box<Entry>>
    where
        F: Fn(&Entry) -> bool,
    {
        let pos = (hcode as usize) & self.mask;
        let mut cur = self.tab[pos].front_mut();
        while let Some(ent) = cur.get() {
            if ent.hcode == hcode && eq(ent) {
                let node = cur.remove();
                if node.is_some() {
                    self.size -= 1;
                }
                return node;
            }
            cur.move_next();
        }
        None
    }

    fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.tab.iter().flat_map(|bucket| bucket.iter())
    }
}

/// Resizable hash map built from two tables. Normally only `newer` is
/// populated; while a migration is in flight `older` still holds the
/// not-yet-moved entries and every operation moves a bounded batch, so no
/// single insert ever pays for a full rehash.
struct HMap {
    newer: HashTable,
    older: Option<HashTable>,
    migrate_pos: usize,
}

impl HMap {
    fn new() -> Self {
        Self {
            newer: HashTable::new(4),
            older: None,
            migrate_pos: 0,
        }
    }

    fn len(&self) -> usize {
        self.newer.size + self.older.as_ref().map_or(0, |t| t.size)
    }

    #[allow(dead_code)]
    fn is_migrating(&self) -> bool {
        self.older.is_some()
    }

    /// Move up to `K_REHASHING_WORK` entries from `older` into `newer`,
    /// releasing `older` once it drains.
    fn help_rehashing(&mut self) {
        let HMap {
            newer,
            older,
            migrate_pos,
        } = self;
        let Some(old) = older.as_mut() else {
            return;
        };

        let mut nwork = 0;
        while nwork < K_REHASHING_WORK && old.size > 0 {
            if *migrate_pos >= old.tab.len() {
                break;
            }
            match old.tab[*migrate_pos].pop_front() {
                Some(entry) => {
                    old.size -= 1;
                    newer.insert(entry);
                    nwork += 1;
                }
                None => *migrate_pos += 1,
            }
        }

        let drained = old.size == 0;
        if drained {
            *older = None;
        }
    }

    fn trigger_rehashing(&mut self) {
        let capacity = (self.newer.mask + 1) * 2;
        let old = std::mem::replace(&mut self.newer, HashTable::new(capacity));
        self.older = Some(old);
        self.migrate_pos = 0;
    }

    /// The newer table is queried first; during a migration a key not yet
    /// moved is still reachable in the older one.
    fn lookup_with<F>(&mut self, hcode: u64, eq: F) -> Option<&Entry>
    where
        F: Fn(&Entry) -> bool,
    {
        self.help_rehashing();
        if let Some(ent) = self.newer.lookup(hcode, &eq) {
            return Some(ent);
        }
        self.older.as_ref().and_then(|old| old.lookup(hcode, &eq))
    }

    fn lookup(&mut self, key: &[u8]) -> Option<&Entry> {
        self.lookup_with(hash_key(key), |ent: &Entry| ent.key == key)
    }

    /// Insertions always land in the newer table, so an entry migrated
    /// after the insert stays reachable. Callers de-duplicate with a
    /// prior lookup.
    fn insert(&mut self, entry: Box<Entry>) {
        self.newer.insert(entry);
        if self.older.is_none() {
            let threshold = (self.newer.mask + 1) * K_MAX_LOAD_FACTOR;
            if self.newer.size >= threshold {
                self.trigger_rehashing();
            }
        }
        self.help_rehashing();
    }

    fn remove_with<F>(&mut self, hcode: u64, eq: F) -> Option<Box<Entry>>
    where
        F: Fn(&Entry) -> bool,
    {
        self.help_rehashing();
        if let Some(entry) = self.newer.take(hcode, &eq) {
            return Some(entry);
        }
        self.older.as_mut().and_then(|old| old.take(hcode, &eq))
    }

    fn remove(&mut self, key: &[u8]) -> Option<Box<Entry>> {
        self.remove_with(hash_key(key), |ent: &Entry| ent.key == key)
    }

    fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.newer
            .iter()
            .chain(self.older.iter().flat_map(|old| old.iter()))
    }

    #[allow(dead_code)]
    fn clear(&mut self) {
        *self = HMap::new();
    }
}

/* sorted set */

type ZNodeRef = Arc<Mutex<ZNode>>;

/// A sorted-set member. One allocation participates in two indexes: the
/// tree links order it by `(score, name)` and the by-name table holds a
/// shared handle to the same node.
struct ZNode {
    tree_parent: Option<ZNodeRef>,
    tree_left: Option<ZNodeRef>,
    tree_right: Option<ZNodeRef>,
    tree_height: u32,
    tree_count: u32,

    score: f64,
    name: Vec<u8>,
}

impl ZNode {
    fn new(score: f64, name: Vec<u8>) -> ZNodeRef {
        Arc::new(Mutex::new(Self {
            tree_parent: None,
            tree_left: None,
            tree_right: None,
            tree_height: 1,
            tree_count: 1,
            score,
            name,
        }))
    }
}

fn znode_height(node: &Option<ZNodeRef>) -> u32 {
    node.as_ref().map_or(0, |n| n.lock().unwrap().tree_height)
}

fn znode_count(node: &Option<ZNodeRef>) -> u32 {
    node.as_ref().map_or(0, |n| n.lock().unwrap().tree_count)
}

fn znode_update(node: &ZNodeRef) {
    let (lh, rh, lc, rc) = {
        let n = node.lock().unwrap();
        (
            znode_height(&n.tree_left),
            znode_height(&n.tree_right),
            znode_count(&n.tree_left),
            znode_count(&n.tree_right),
        )
    };
    let mut n = node.lock().unwrap();
    n.tree_height = 1 + lh.max(rh);
    n.tree_count = 1 + lc + rc;
}

/// `(lhs.score, lhs.name) < (rhs.score, rhs.name)`, names in unsigned
/// byte order.
fn zless(lhs: &ZNodeRef, rhs: &ZNodeRef) -> bool {
    let l = lhs.lock().unwrap();
    let r = rhs.lock().unwrap();
    (OrderedFloat(l.score), l.name.as_slice()) < (OrderedFloat(r.score), r.name.as_slice())
}

/// Rotations reshape a subtree while keeping its order. The new subtree
/// root inherits the old parent pointer; the caller reattaches the
/// parent's child link.
fn znode_rot_left(node: ZNodeRef) -> ZNodeRef {
    let parent = node.lock().unwrap().tree_parent.clone();
    let new_node = node
        .lock()
        .unwrap()
        .tree_right
        .clone()
        .expect("left rotation needs a right child");
    let inner = new_node.lock().unwrap().tree_left.clone();

    // node <-> inner
    node.lock().unwrap().tree_right = inner.clone();
    if let Some(inner) = &inner {
        inner.lock().unwrap().tree_parent = Some(Arc::clone(&node));
    }

    // parent <- new_node
    new_node.lock().unwrap().tree_parent = parent;

    // new_node <-> node
    new_node.lock().unwrap().tree_left = Some(Arc::clone(&node));
    node.lock().unwrap().tree_parent = Some(Arc::clone(&new_node));

    znode_update(&node);
    znode_update(&new_node);
    new_node
}

fn znode_rot_right(node: ZNodeRef) -> ZNodeRef {
    let parent = node.lock().unwrap().tree_parent.clone();
    let new_node = node
        .lock()
        .unwrap()
        .tree_left
        .clone()
        .expect("right rotation needs a left child");
    let inner = new_node.lock().unwrap().tree_right.clone();

    // node <-> inner
    node.lock().unwrap().tree_left = inner.clone();
    if let Some(inner) = &inner {
        inner.lock().unwrap().tree_parent = Some(Arc::clone(&node));
    }

    // parent <- new_node
    new_node.lock().unwrap().tree_parent = parent;

    // new_node <-> node
    new_node.lock().unwrap().tree_right = Some(Arc::clone(&node));
    node.lock().unwrap().tree_parent = Some(Arc::clone(&new_node));

    znode_update(&node);
    znode_update(&new_node);
    new_node
}

/// The left subtree is too tall by 2.
fn znode_fix_left(node: ZNodeRef) -> ZNodeRef {
    let left = node
        .lock()
        .unwrap()
        .tree_left
        .clone()
        .expect("left-heavy node has a left child");
    let (ll, lr) = {
        let l = left.lock().unwrap();
        (znode_height(&l.tree_left), znode_height(&l.tree_right))
    };
    if ll < lr {
        // left-right case: rotate the left child first
        let new_left = znode_rot_left(left);
        node.lock().unwrap().tree_left = Some(new_left);
    }
    znode_rot_right(node)
}

/// The right subtree is too tall by 2.
fn znode_fix_right(node: ZNodeRef) -> ZNodeRef {
    let right = node
        .lock()
        .unwrap()
        .tree_right
        .clone()
        .expect("right-heavy node has a right child");
    let (rl, rr) = {
        let r = right.lock().unwrap();
        (znode_height(&r.tree_left), znode_height(&r.tree_right))
    };
    if rr < rl {
        // right-left case: rotate the right child first
        let new_right = znode_rot_right(right);
        node.lock().unwrap().tree_right = Some(new_right);
    }
    znode_rot_left(node)
}

/// Walk from `node` to the root, refreshing heights and counts and fixing
/// any height difference of 2 on the way. Returns the (possibly new) root.
fn znode_fix(start: ZNodeRef) -> ZNodeRef {
    let mut node = start;
    loop {
        let parent = node.lock().unwrap().tree_parent.clone();

        znode_update(&node);
        let (lh, rh) = {
            let n = node.lock().unwrap();
            (znode_height(&n.tree_left), znode_height(&n.tree_right))
        };

        let fixed = if lh == rh + 2 {
            znode_fix_left(Arc::clone(&node))
        } else if lh + 2 == rh {
            znode_fix_right(Arc::clone(&node))
        } else {
            Arc::clone(&node)
        };

        match parent {
            Some(p) => {
                {
                    let mut pg = p.lock().unwrap();
                    if pg
                        .tree_left
                        .as_ref()
                        .is_some_and(|l| Arc::ptr_eq(l, &node))
                    {
                        pg.tree_left = Some(fixed);
                    } else {
                        pg.tree_right = Some(fixed);
                    }
                }
                node = p;
            }
            None => return fixed,
        }
    }
}

/// Detach a node with at most one child: splice the child into its place
/// and rebalance from the parent. Returns the new root.
fn znode_del_easy(target: &ZNodeRef) -> Option<ZNodeRef> {
    let (child, parent) = {
        let t = target.lock().unwrap();
        assert!(t.tree_left.is_none() || t.tree_right.is_none());
        (
            t.tree_left.clone().or_else(|| t.tree_right.clone()),
            t.tree_parent.clone(),
        )
    };

    if let Some(child) = &child {
        child.lock().unwrap().tree_parent = parent.clone();
    }

    let Some(parent) = parent else {
        return child; // removed the root
    };
    {
        let mut pg = parent.lock().unwrap();
        if pg
            .tree_left
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(l, target))
        {
            pg.tree_left = child;
        } else {
            pg.tree_right = child;
        }
    }
    Some(znode_fix(parent))
}

/// Detach a node from the tree. With two children the in-order successor
/// is spliced out via the easy case and then substituted into the
/// target's slot, links, height and count included, so the successor node
/// keeps its own identity (the name index still points at it).
fn znode_del(target: &ZNodeRef) -> Option<ZNodeRef> {
    let (has_left, has_right) = {
        let t = target.lock().unwrap();
        (t.tree_left.is_some(), t.tree_right.is_some())
    };
    if !has_left || !has_right {
        let root = znode_del_easy(target);
        znode_clear_links(target);
        return root;
    }

    // find the successor: leftmost of the right subtree
    let mut victim = {
        let t = target.lock().unwrap();
        t.tree_right.clone().expect("checked above")
    };
    loop {
        let next = victim.lock().unwrap().tree_left.clone();
        match next {
            Some(left) => victim = left,
            None => break,
        }
    }

    // detach the successor, then read the target's links; the order
    // matters because the detach may have rewired them
    let mut root = znode_del_easy(&victim);

    let (t_parent, t_left, t_right, t_height, t_count) = {
        let t = target.lock().unwrap();
        (
            t.tree_parent.clone(),
            t.tree_left.clone(),
            t.tree_right.clone(),
            t.tree_height,
            t.tree_count,
        )
    };
    {
        let mut v = victim.lock().unwrap();
        v.tree_parent = t_parent.clone();
        v.tree_left = t_left.clone();
        v.tree_right = t_right.clone();
        v.tree_height = t_height;
        v.tree_count = t_count;
    }
    if let Some(left) = &t_left {
        left.lock().unwrap().tree_parent = Some(Arc::clone(&victim));
    }
    if let Some(right) = &t_right {
        right.lock().unwrap().tree_parent = Some(Arc::clone(&victim));
    }
    match &t_parent {
        Some(parent) => {
            let mut pg = parent.lock().unwrap();
            if pg
                .tree_left
                .as_ref()
                .is_some_and(|l| Arc::ptr_eq(l, target))
            {
                pg.tree_left = Some(Arc::clone(&victim));
            } else {
                pg.tree_right = Some(Arc::clone(&victim));
            }
        }
        None => root = Some(Arc::clone(&victim)),
    }

    znode_clear_links(target);
    root
}

fn znode_clear_links(node: &ZNodeRef) {
    let mut n = node.lock().unwrap();
    n.tree_parent = None;
    n.tree_left = None;
    n.tree_right = None;
    n.tree_height = 1;
    n.tree_count = 1;
}

/// Move `offset` positions in in-order (negative moves backward), using
/// the subtree counts to skip whole subtrees. Worst case O(log N) no
/// matter how far the offset reaches; None if it lands out of range.
fn znode_offset(node: Option<ZNodeRef>, offset: i64) -> Option<ZNodeRef> {
    let mut node = node?;
    let mut pos: i64 = 0; // rank difference from the starting node
    while pos != offset {
        let (lcount, rcount) = {
            let n = node.lock().unwrap();
            (
                znode_count(&n.tree_left) as i64,
                znode_count(&n.tree_right) as i64,
            )
        };
        if pos < offset && pos + rcount >= offset {
            // the target is inside the right subtree
            let right = node.lock().unwrap().tree_right.clone().expect("rcount > 0");
            node = right;
            pos += znode_count(&node.lock().unwrap().tree_left) as i64 + 1;
        } else if pos > offset && pos - lcount <= offset {
            // the target is inside the left subtree
            let left = node.lock().unwrap().tree_left.clone().expect("lcount > 0");
            node = left;
            pos -= znode_count(&node.lock().unwrap().tree_right) as i64 + 1;
        } else {
            // neither subtree can hold it: go up
            let parent = node.lock().unwrap().tree_parent.clone();
            match parent {
                Some(p) => {
                    let from_right = p
                        .lock()
                        .unwrap()
                        .tree_right
                        .as_ref()
                        .is_some_and(|r| Arc::ptr_eq(r, &node));
                    if from_right {
                        pos -= lcount + 1;
                    } else {
                        pos += rcount + 1;
                    }
                    node = p;
                }
                None => return None,
            }
        }
    }
    Some(node)
}

/// Post-order teardown that severs every link, since parent and child
/// handles otherwise keep each other alive.
fn znode_dispose(node: Option<ZNodeRef>) {
    let Some(node) = node else {
        return;
    };
    let (left, right) = {
        let mut n = node.lock().unwrap();
        n.tree_parent = None;
        (n.tree_left.take(), n.tree_right.take())
    };
    znode_dispose(left);
    znode_dispose(right);
}

/// A collection of `(name, score)` pairs, unique by name, ordered by
/// `(score, name)`. Clients ask by name (the hash index) and by rank or
/// score range (the tree), so both indexes are maintained in lockstep.
struct ZSet {
    root: Option<ZNodeRef>,
    name_to_node: HashMap<Vec<u8>, ZNodeRef>,
}

impl ZSet {
    fn new() -> Self {
        Self {
            root: None,
            name_to_node: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.name_to_node.len()
    }

    fn tree_insert(&mut self, node: ZNodeRef) {
        let mut parent: Option<ZNodeRef> = None;
        let mut cur = self.root.clone();
        let mut go_left = false;
        while let Some(c) = cur {
            go_left = zless(&node, &c);
            cur = {
                let cg = c.lock().unwrap();
                if go_left {
                    cg.tree_left.clone()
                } else {
                    cg.tree_right.clone()
                }
            };
            parent = Some(c);
        }

        node.lock().unwrap().tree_parent = parent.clone();
        match parent {
            Some(p) => {
                {
                    let mut pg = p.lock().unwrap();
                    if go_left {
                        pg.tree_left = Some(Arc::clone(&node));
                    } else {
                        pg.tree_right = Some(Arc::clone(&node));
                    }
                }
                self.root = Some(znode_fix(node));
            }
            None => self.root = Some(node),
        }
    }

    /// Detaching and re-inserting the tree node puts it back in order
    /// under the new score. The name index is left alone.
    fn update_score(&mut self, node: &ZNodeRef, score: f64) {
        self.root = znode_del(node);
        node.lock().unwrap().score = score;
        self.tree_insert(Arc::clone(node));
    }

    /// Add a member, or re-score it if the name already exists. Returns
    /// whether a new member was added.
    fn insert(&mut self, name: &[u8], score: f64) -> bool {
        if let Some(node) = self.name_to_node.get(name).cloned() {
            self.update_score(&node, score);
            return false;
        }
        let node = ZNode::new(score, name.to_vec());
        self.name_to_node.insert(name.to_vec(), Arc::clone(&node));
        self.tree_insert(node);
        true
    }

    fn lookup(&self, name: &[u8]) -> Option<ZNodeRef> {
        self.name_to_node.get(name).cloned()
    }

    /// Remove a member from both indexes.
    fn remove(&mut self, node: &ZNodeRef) {
        let name = node.lock().unwrap().name.clone();
        let found = self.name_to_node.remove(&name);
        assert!(found.is_some(), "node is a member of this set");
        self.root = znode_del(node);
    }

    /// Least node with `(score, name) >= (key_score, key_name)`.
    fn seek_ge(&self, score: f64, name: &[u8]) -> Option<ZNodeRef> {
        let mut found: Option<ZNodeRef> = None;
        let mut cur = self.root.clone();
        while let Some(node) = cur {
            let (is_less, left, right) = {
                let n = node.lock().unwrap();
                (
                    (OrderedFloat(n.score), n.name.as_slice()) < (OrderedFloat(score), name),
                    n.tree_left.clone(),
                    n.tree_right.clone(),
                )
            };
            if is_less {
                cur = right;
            } else {
                found = Some(node); // candidate
                cur = left;
            }
        }
        found
    }

    /// Destroy both indexes and free every node.
    fn clear(&mut self) {
        self.name_to_node.clear();
        znode_dispose(self.root.take());
    }
}

impl Drop for ZSet {
    fn drop(&mut self) {
        self.clear();
    }
}

/* command engine */

/// Everything the command handlers operate on. Owned by `run_server` and
/// threaded through the dispatcher; the single-threaded loop means no
/// locking on any of it.
struct GData {
    db: HMap,
    /// Live expiration deadlines, keyed by entry key.
    ttl: HashMap<Vec<u8>, u64>,
    /// Min-heap over the deadlines in `ttl` (may also hold stale items).
    heap: Vec<HeapItem>,
    pool: ThreadPool,
}

impl GData {
    fn new() -> Self {
        Self {
            db: HMap::new(),
            ttl: HashMap::new(),
            heap: Vec::new(),
            pool: ThreadPool::new(NUM_WORKER_THREADS),
        }
    }
}

/// Remove a key and its TTL, if present. Disposal of a large sorted set
/// is handed to the worker pool so the event loop never pays for the
/// O(N) teardown.
fn entry_del(g: &mut GData, key: &[u8]) -> bool {
    let Some(entry) = g.db.remove(key) else {
        return false;
    };
    g.ttl.remove(key);

    let set_size = match &entry.value {
        Value::ZSet(zset) => zset.len(),
        Value::Str(_) => 0,
    };
    if set_size > K_LARGE_CONTAINER_SIZE {
        debug!("offloading disposal of a {set_size}-member set");
        g.pool.submit(Work::Dispose(entry));
    }
    true
}

fn do_get(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    match g.db.lookup(&cmd[1]) {
        None => out.write_nil(),
        Some(ent) => match &ent.value {
            Value::Str(val) => out.write_str(val),
            Value::ZSet(_) => out.write_err(ErrCode::BadTyp, "not a string value"),
        },
    }
}

fn do_set(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    match g.db.remove(&cmd[1]) {
        Some(mut ent) => {
            let Value::Str(ref mut val) = ent.value else {
                g.db.insert(ent);
                return out.write_err(ErrCode::BadTyp, "a non-string value exists");
            };
            *val = cmd[2].clone();
            g.db.insert(ent);
        }
        None => {
            let ent = Entry::new(cmd[1].clone(), Value::Str(cmd[2].clone()));
            g.db.insert(Box::new(ent));
        }
    }
    out.write_nil();
}

fn do_del(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let removed = entry_del(g, &cmd[1]);
    out.write_int(removed as i64);
}

fn do_keys(g: &mut GData, out: &mut Buffer) {
    out.write_arr(g.db.len() as u32);
    for ent in g.db.iter() {
        out.write_str(&ent.key);
    }
}

fn do_zadd(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_f64(&cmd[2]) else {
        return out.write_err(ErrCode::BadArg, "expect float");
    };

    // fetch or create the set; a wrong-typed entry goes straight back
    let (ent, added) = match g.db.remove(&cmd[1]) {
        Some(mut ent) => {
            let Value::ZSet(ref mut zset) = ent.value else {
                g.db.insert(ent);
                return out.write_err(ErrCode::BadTyp, "expect zset");
            };
            let added = zset.insert(&cmd[3], score);
            (ent, added)
        }
        None => {
            let mut zset = ZSet::new();
            let added = zset.insert(&cmd[3], score);
            let ent = Entry::new(cmd[1].clone(), Value::ZSet(zset));
            (Box::new(ent), added)
        }
    };
    g.db.insert(ent);
    out.write_int(added as i64);
}

fn do_zrem(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(mut ent) = g.db.remove(&cmd[1]) else {
        return out.write_int(0); // missing key acts as an empty set
    };
    let Value::ZSet(ref mut zset) = ent.value else {
        g.db.insert(ent);
        return out.write_err(ErrCode::BadTyp, "expect zset");
    };

    let removed = match zset.lookup(&cmd[2]) {
        Some(node) => {
            zset.remove(&node);
            true
        }
        None => false,
    };
    g.db.insert(ent);
    out.write_int(removed as i64);
}

fn do_zscore(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(ent) = g.db.lookup(&cmd[1]) else {
        return out.write_nil(); // missing key acts as an empty set
    };
    let Value::ZSet(zset) = &ent.value else {
        return out.write_err(ErrCode::BadTyp, "expect zset");
    };
    match zset.lookup(&cmd[2]) {
        Some(node) => {
            let score = node.lock().unwrap().score;
            out.write_dbl(score);
        }
        None => out.write_nil(),
    }
}

/// `zquery key score name offset limit`: from the least `(score, name) >=`
/// the given pair, skip `offset` members, then emit up to `limit`
/// `(name, score)` pairs. The array count is the total element count, so
/// each pair contributes 2.
fn do_zquery(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_f64(&cmd[2]) else {
        return out.write_err(ErrCode::BadArg, "expect floating point number");
    };
    let (Some(offset), Some(limit)) = (parse_i64(&cmd[4]), parse_i64(&cmd[5])) else {
        return out.write_err(ErrCode::BadArg, "expect int");
    };

    let zset = match g.db.lookup(&cmd[1]) {
        None => {
            return out.write_arr(0); // missing key acts as an empty set
        }
        Some(ent) => match &ent.value {
            Value::ZSet(zset) => zset,
            Value::Str(_) => return out.write_err(ErrCode::BadTyp, "expect zset"),
        },
    };

    if limit <= 0 {
        return out.write_arr(0);
    }
    let mut node = znode_offset(zset.seek_ge(score, &cmd[3]), offset);

    let ctx = out.begin_arr();
    let mut n: i64 = 0;
    while let Some(cur) = node {
        if n >= limit.saturating_mul(2) {
            break;
        }
        let (name, score) = {
            let c = cur.lock().unwrap();
            (c.name.clone(), c.score)
        };
        out.write_str(&name);
        out.write_dbl(score);
        n += 2;
        node = znode_offset(Some(cur), 1);
    }
    out.end_arr(ctx, n as u32);
}

fn do_expire(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(seconds) = parse_i64(&cmd[2]) else {
        return out.write_err(ErrCode::BadArg, "expect int64");
    };
    if g.db.lookup(&cmd[1]).is_none() {
        return out.write_int(0);
    }

    if seconds <= 0 {
        g.ttl.remove(&cmd[1]);
    } else {
        let deadline = get_monotonic_ms().saturating_add((seconds as u64).saturating_mul(1000));
        g.ttl.insert(cmd[1].clone(), deadline);
        heap_push(
            &mut g.heap,
            HeapItem {
                val: deadline,
                key: cmd[1].clone(),
            },
        );
    }
    out.write_int(1);
}

fn do_ttl(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    if g.db.lookup(&cmd[1]).is_none() {
        return out.write_int(-2);
    }
    match g.ttl.get(&cmd[1]) {
        None => out.write_int(-1),
        Some(&deadline) => {
            let now = get_monotonic_ms();
            let remaining = deadline.saturating_sub(now);
            out.write_int((remaining.div_ceil(1000)) as i64);
        }
    }
}

fn do_persist(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    if g.db.lookup(&cmd[1]).is_none() {
        return out.write_int(0);
    }
    let had_ttl = g.ttl.remove(&cmd[1]).is_some();
    out.write_int(had_ttl as i64);
}

/// Dispatch on the first word, case-sensitively, with exact arity. A
/// wrong command or arity both come back as ERR(Unknown).
fn do_request(g: &mut GData, cmd: &[Vec<u8>], out: &mut Buffer) {
    match (cmd.len(), cmd.first().map(|w| w.as_slice())) {
        (2, Some(b"get")) => do_get(g, cmd, out),
        (3, Some(b"set")) => do_set(g, cmd, out),
        (2, Some(b"del")) => do_del(g, cmd, out),
        (1, Some(b"keys")) => do_keys(g, out),
        (4, Some(b"zadd")) => do_zadd(g, cmd, out),
        (3, Some(b"zrem")) => do_zrem(g, cmd, out),
        (3, Some(b"zscore")) => do_zscore(g, cmd, out),
        (6, Some(b"zquery")) => do_zquery(g, cmd, out),
        (3, Some(b"expire")) => do_expire(g, cmd, out),
        (2, Some(b"ttl")) => do_ttl(g, cmd, out),
        (2, Some(b"persist")) => do_persist(g, cmd, out),
        _ => out.write_err(ErrCode::Unknown, "unknown command"),
    }
}

/* connections */

/// Per-connection state. The `want_*` flags are the application's intent
/// for the next poll round; the loop owns the connection and destroys it
/// once `want_close` is observed.
struct Conn {
    socket: Socket,

    want_read: bool,
    want_write: bool,
    want_close: bool,

    incoming: Buffer,
    outgoing: Buffer,

    last_active_ms: u64,
    idle_node: DListRef,
}

impl Conn {
    fn new(socket: Socket) -> Self {
        let fd = socket.as_raw_fd();
        Self {
            socket,
            want_read: true, // read the first request
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            last_active_ms: get_monotonic_ms(),
            idle_node: dlist_new(fd),
        }
    }
}

fn conn_events(conn: &Conn) -> PollFlags {
    let mut events = PollFlags::POLLERR;
    if conn.want_read {
        events |= PollFlags::POLLIN;
    }
    if conn.want_write {
        events |= PollFlags::POLLOUT;
    }
    events
}

/// Consume one complete framed request if the buffer holds one. Returns
/// false when more bytes are needed; a protocol violation flags the
/// connection for closing without a reply.
fn try_one_request(conn: &mut Conn, g: &mut GData) -> bool {
    if conn.incoming.len() < 4 {
        return false; // want read
    }
    let data = conn.incoming.data();
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > K_MAX_MSG {
        warn!("message too long ({len} bytes)");
        conn.want_close = true;
        return false;
    }
    if conn.incoming.len() < 4 + len {
        return false; // want read
    }

    let cmd = match parse_req(&conn.incoming[4..4 + len]) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("bad request: {e}");
            conn.want_close = true;
            return false;
        }
    };

    let header = conn.outgoing.begin_response();
    do_request(g, &cmd, &mut conn.outgoing);
    conn.outgoing.end_response(header);

    conn.incoming.consume(4 + len);
    true
}

fn handle_read(conn: &mut Conn, g: &mut GData) {
    let mut buf = [0u8; 64 * 1024];
    let n = match conn.socket.read(&mut buf) {
        Ok(0) => {
            if conn.incoming.is_empty() {
                info!("client closed");
            } else {
                warn!("unexpected EOF");
            }
            conn.want_close = true;
            return;
        }
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return, // not actually ready
        Err(e) => {
            warn!("read() error: {e}");
            conn.want_close = true;
            return;
        }
    };
    conn.incoming.append(&buf[..n]);

    // pipelining: drain every complete request that has arrived
    while try_one_request(conn, g) {}

    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // in a request-response protocol the socket is usually writable
        // already; try before the next poll round
        handle_write(conn);
    }
}

fn handle_write(conn: &mut Conn) {
    assert!(!conn.outgoing.is_empty());
    let n = match conn.socket.write(&conn.outgoing) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return, // not actually ready
        Err(e) => {
            warn!("write() error: {e}");
            conn.want_close = true;
            return;
        }
    };
    conn.outgoing.consume(n);

    if conn.outgoing.is_empty() {
        conn.want_read = true;
        conn.want_write = false;
    } // else: keep want_write
}

/* timers */

/// Milliseconds until the nearest deadline, idle or TTL; None when no
/// timer is armed.
fn next_timer_ms(g: &GData, fd2conn: &HashMap<RawFd, Conn>, idle_head: &DListRef) -> Option<u64> {
    let mut next: Option<u64> = None;

    // the least recently active connection sits at the front
    if !dlist_empty(idle_head) {
        let first = idle_head.lock().unwrap().next.clone();
        if let Some(node) = first {
            let fd = node.lock().unwrap().fd;
            if let Some(conn) = fd2conn.get(&fd) {
                next = Some(conn.last_active_ms + K_IDLE_TIMEOUT_MS);
            }
        }
    }
    if let Some(item) = g.heap.first() {
        next = Some(next.map_or(item.val, |v| v.min(item.val)));
    }
    next.map(|deadline| deadline.saturating_sub(get_monotonic_ms()))
}

fn process_timers(g: &mut GData, fd2conn: &mut HashMap<RawFd, Conn>, idle_head: &DListRef) {
    let now = get_monotonic_ms();

    // idle connections, oldest first
    while !dlist_empty(idle_head) {
        let Some(node) = idle_head.lock().unwrap().next.clone() else {
            break;
        };
        let fd = node.lock().unwrap().fd;
        let Some(conn) = fd2conn.get(&fd) else {
            dlist_detach(&node); // no owner left
            continue;
        };
        if conn.last_active_ms + K_IDLE_TIMEOUT_MS > now {
            break; // the rest are younger
        }
        info!("idle timeout, closing fd {fd}");
        if let Some(conn) = fd2conn.remove(&fd) {
            dlist_detach(&conn.idle_node);
        }
    }

    // expired keys, bounded work per pass
    let mut nworks = 0;
    while nworks < K_MAX_WORKS {
        if !g.heap.first().is_some_and(|item| item.val <= now) {
            break;
        }
        let Some(item) = heap_pop_min(&mut g.heap) else {
            break;
        };
        // discard heap items that no longer match the live deadline
        if g.ttl.get(&item.key) != Some(&item.val) {
            continue;
        }
        debug!("key expired");
        entry_del(g, &item.key);
        nworks += 1;
    }
}

/* event loop */

fn run_server() -> io::Result<()> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], SERVER_PORT));
    listener.bind(&SockAddr::from(addr))?;
    listener.set_nonblocking(true)?;
    listener.listen(BACKLOG)?;
    info!("listening on {addr}");

    let mut g = GData::new();
    // all client connections, keyed by fd
    let mut fd2conn: HashMap<RawFd, Conn> = HashMap::new();
    let idle_head = dlist_new(-1);
    dlist_init(&idle_head);

    loop {
        let timeout = match next_timer_ms(&g, &fd2conn, &idle_head) {
            None => PollTimeout::NONE,
            Some(ms) => PollTimeout::from(ms.min(u16::MAX as u64) as u16),
        };

        // poll() is the only blocking call in the whole server. The
        // listener is always in slot 0; connection subscriptions follow
        // the want_* flags.
        let (listener_ready, ready) = {
            let mut poll_fds: Vec<PollFd> = Vec::with_capacity(fd2conn.len() + 1);
            poll_fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            let mut order: Vec<RawFd> = Vec::with_capacity(fd2conn.len());
            for (&fd, conn) in fd2conn.iter() {
                poll_fds.push(PollFd::new(conn.socket.as_fd(), conn_events(conn)));
                order.push(fd);
            }

            match poll(&mut poll_fds, timeout) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue, // not an error
                Err(e) => return Err(io::Error::from(e)),
            }

            let listener_ready = poll_fds[0]
                .revents()
                .unwrap_or(PollFlags::empty())
                .intersects(PollFlags::POLLIN);
            let ready: Vec<(RawFd, PollFlags)> = poll_fds[1..]
                .iter()
                .zip(order)
                .filter_map(|(pfd, fd)| {
                    let revents = pfd.revents().unwrap_or(PollFlags::empty());
                    (!revents.is_empty()).then_some((fd, revents))
                })
                .collect();
            (listener_ready, ready)
        };

        if listener_ready {
            match listener.accept() {
                Ok((socket, addr)) => match socket.set_nonblocking(true) {
                    Ok(()) => {
                        if let Some(peer) = addr.as_socket() {
                            info!("new client from {peer}");
                        }
                        let fd = socket.as_raw_fd();
                        let conn = Conn::new(socket);
                        dlist_insert_before(&idle_head, &conn.idle_node);
                        fd2conn.insert(fd, conn);
                    }
                    Err(e) => warn!("fcntl error: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("accept() error: {e}"),
            }
        }

        for (fd, revents) in ready {
            let Some(conn) = fd2conn.get_mut(&fd) else {
                continue;
            };

            // this connection just saw activity: move it to the young
            // end of the idle list
            conn.last_active_ms = get_monotonic_ms();
            dlist_detach(&conn.idle_node);
            dlist_insert_before(&idle_head, &conn.idle_node);

            if revents.intersects(PollFlags::POLLIN) && conn.want_read {
                handle_read(conn, &mut g);
            }
            if revents.intersects(PollFlags::POLLOUT)
                && conn.want_write
                && !conn.outgoing.is_empty()
            {
                handle_write(conn);
            }

            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) || conn.want_close {
                if let Some(conn) = fd2conn.remove(&fd) {
                    dlist_detach(&conn.idle_node);
                    info!("closed connection on fd {fd}");
                }
            }
        }

        process_timers(&mut g, &mut fd2conn, &idle_head);
    }
}

/* client */

fn send_req(socket: &mut Socket, cmd: &[String]) -> io::Result<()> {
    let mut body = Buffer::new();
    body.append_u32(cmd.len() as u32);
    for word in cmd {
        body.append_u32(word.len() as u32);
        body.append(word.as_bytes());
    }
    if body.len() > K_MAX_MSG {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "request too long",
        ));
    }

    let mut frame = Buffer::new();
    frame.append_u32(body.len() as u32);
    frame.append(&body);
    socket.write_all(&frame)
}

fn read_res(socket: &mut Socket) -> io::Result<RedisValue> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > K_MAX_MSG {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "reply too long"));
    }
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body)?;

    let mut cur = &body[..];
    let value =
        RedisValue::parse(&mut cur).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !cur.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailing bytes in reply",
        ));
    }
    Ok(value)
}

/// Send one command to a local server and print the tagged reply.
fn run_client(cmd: &[String]) -> io::Result<()> {
    let mut socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    let addr = SocketAddr::from(([127, 0, 0, 1], SERVER_PORT));
    socket.connect(&SockAddr::from(addr))?;

    send_req(&mut socket, cmd)?;
    let value = read_res(&mut socket)?;
    println!("{value}");
    Ok(())
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "minikv=info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() > 1 && args[1] == "client" {
        run_client(&args[2..])
    } else {
        run_server()
    }
}
