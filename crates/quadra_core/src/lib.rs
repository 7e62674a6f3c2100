pub mod consts;
pub mod errors;
pub mod utils;
pub mod filter;
pub mod segment;
pub mod manifest;
pub mod config;
pub mod node;
pub mod ordering;
pub mod pool;
pub mod quad_index;
pub mod tuples;
pub mod resolution;
pub mod sorted;
pub mod txn;
pub mod backup;
pub mod store;

pub use config::StoreConfig;
pub use consts::{NodeId, SegmentKind, MIN_NODE, NONE};
pub use errors::{QuadError, Result};
pub use node::{Limit, NodeValue, RangeValue, TypeCategory};
pub use ordering::{NodeOrdering, ValueComparator};
pub use pool::{RangeBound, ValuePool};
pub use quad_index::{ColumnOrder, Quad, QuadIndex};
pub use resolution::{Constraint, NodeRef, Resolution};
pub use segment::{SegmentReader, SegmentWriter};
pub use sorted::{ComparatorRegistry, RowComparator, SortedRelation, ID_ORDER, VALUE_ORDER};
pub use store::{QuadStore, StoreInfo};
pub use tuples::{Cardinality, RowTuples, Tuples, Variable};
pub use txn::{Coordinator, EndFlag, StartFlag, TxState, Vote, XaResource, Xid};
