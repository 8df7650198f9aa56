//! 哈希表核心模块 - 级联Cuckoo哈希表及其组件

pub mod cuckoo_map;
pub mod subtable;

pub use cuckoo_map::{CuckooMap, CuckooMapConfig, CuckooMapStats, Finding};
pub use subtable::{InsertStatus, PlacedSlot, Subtable, SLOTS_PER_BUCKET};

use once_cell::sync::Lazy;

/// 全局默认配置
pub static DEFAULT_CONFIG: Lazy<CuckooMapConfig> = Lazy::new(CuckooMapConfig::default);
