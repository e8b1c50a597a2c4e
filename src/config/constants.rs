//! # Configuration Constants
//!
//! All numeric tunables for NdxFile live here. Most sizing in the engine is
//! *per index* and persisted in that index's `IndexInfo` record, so these
//! constants are defaults and floors rather than global truths.
//!
//! ## Dependency Notes
//!
//! ```text
//! NIL_POS (-1)
//!       Every *_pos field on disk uses -1 as "nil". The free-list
//!       terminator, the EOF sentinel's data position, and the public NIL
//!       return value are all this constant. Changing it would change the
//!       file format.
//!
//! MIN_MAX_ITEMS (3)
//!       The insert path moves at most one item to a sibling before placing
//!       the new item, and the delete path merges when two siblings fit in
//!       fan_out / 2 slots. Both need at least three slots per node to make
//!       progress, so init_index rejects smaller fan-outs.
//!
//! DEFAULT_NODE_BATCH / DEFAULT_LEAF_BATCH
//!       Free blocks are pre-created in batches at end-of-file; a larger
//!       batch amortizes file extension at the cost of dead space in small
//!       files. Leaves outnumber nodes roughly fan_out to one, which is why
//!       the leaf default is the larger of the two.
//! ```

/// The on-disk and API-level "no position" marker.
pub const NIL_POS: i64 = -1;

/// Smallest fan-out `init_index` accepts.
pub const MIN_MAX_ITEMS: u16 = 3;

/// Default fan-out (items per internal node) for new indexes.
pub const DEFAULT_MAX_ITEMS: u16 = 5;

/// Default number of node blocks pre-created per free-list refill.
pub const DEFAULT_NODE_BATCH: i64 = 100;

/// Default number of leaf blocks pre-created per free-list refill.
pub const DEFAULT_LEAF_BATCH: i64 = 200;

/// Default number of hole records per heap-file holes table.
pub const DEFAULT_HOLES_TABLE_SIZE: u16 = 100;

const _: () = assert!(MIN_MAX_ITEMS >= 3);
const _: () = assert!(DEFAULT_MAX_ITEMS >= MIN_MAX_ITEMS);
const _: () = assert!(DEFAULT_NODE_BATCH > 0 && DEFAULT_LEAF_BATCH > 0);
