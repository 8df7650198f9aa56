//! 级联Cuckoo哈希表库
//!
//! 面向小固定布局键值的并发内存关联容器：Cuckoo哈希提供有界的最坏
//! 探测成本，层叠子表在踢出预算耗尽时按4倍容量几何增长吸收溢出，
//! 深层命中在查找时被提升回第0层，保持热工作集的探测路径最短。
//!
//! ## 主要特性
//! - 单层查找最多探测 2×4 个槽位，指纹先行过滤
//! - 插入驱逐有界（踢出预算），溢出级联到更大的下一层
//! - 值为运行期配置大小/对齐的字节块，原地可变
//! - 单互斥锁并发；`Finding` 句柄持锁期间可安全修改槽内数据
//!
//! ## 快速开始
//!
//! ```rust
//! use cuckoo_cascade::CuckooMap;
//!
//! let map = CuckooMap::<u64>::for_value::<u64>(16).unwrap();
//!
//! // 插入键值对
//! map.insert(7, &700u64.to_ne_bytes()).unwrap();
//!
//! // 查找：Finding在存活期间持有表锁
//! {
//!     let found = map.lookup(&7);
//!     assert!(found.found());
//!     assert_eq!(found.value().unwrap(), &700u64.to_ne_bytes());
//! }
//!
//! // 删除
//! assert!(map.remove(&7));
//! assert_eq!(map.nr_used(), 0);
//! ```

#![warn(clippy::all)]

#[cfg(feature = "logging")]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

#[cfg(feature = "logging")]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

#[cfg(feature = "logging")]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

#[cfg(feature = "logging")]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "logging"))]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "logging"))]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "logging"))]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {};
}

// 核心模块导出
pub mod error;
pub mod hash;
pub mod map;
pub mod memory;
pub mod types;

// 公共接口导出
pub use crate::{
    error::CuckooError,
    hash::{
        DefaultFingerprintGenerator, DoubleHasher, FingerprintGenerator, HashAlgorithm,
        HasherFunction,
    },
    map::{
        CuckooMap, CuckooMapConfig, CuckooMapStats, Finding, InsertStatus, PlacedSlot, Subtable,
        DEFAULT_CONFIG, SLOTS_PER_BUCKET,
    },
    memory::{SlotLayout, TableArena},
    types::{DefaultCompare, Fingerprint, FixedKey, KeyCompare},
};

/// 默认相等关系下的表别名（分片封装按此形状组合多个独立表）
pub type DefaultMap<K> = CuckooMap<K, DefaultCompare>;

// 便捷功能函数

/// 批量插入，返回成功插入的条目数
pub fn batch_insert<'v, K, C>(
    map: &CuckooMap<K, C>,
    items: impl IntoIterator<Item = (K, &'v [u8])>,
) -> usize
where
    K: FixedKey,
    C: KeyCompare<K> + Clone,
{
    let mut count = 0;
    for (key, value) in items {
        if let Ok(true) = map.insert(key, value) {
            count += 1;
        }
    }
    count
}

/// 批量查询，逐键拷贝出值字节
pub fn batch_lookup<'k, K, C>(
    map: &CuckooMap<K, C>,
    keys: impl IntoIterator<Item = &'k K>,
) -> Vec<Option<Vec<u8>>>
where
    K: FixedKey,
    C: KeyCompare<K> + Clone,
{
    keys.into_iter()
        .map(|key| {
            let found = map.lookup(key);
            found.value().map(|bytes| bytes.to_vec())
        })
        .collect()
}
