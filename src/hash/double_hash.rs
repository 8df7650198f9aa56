//! 双哈希 - 两个独立种子的哈希函数定位候选桶

use crate::{
    hash::fingerprint::{DefaultFingerprintGenerator, FingerprintGenerator},
    types::{Fingerprint, FixedKey},
};
use ahash::RandomState;
use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

/// 哈希算法选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    AHash,
    XxHash,
    Default,
}

/// 哈希函数特征
pub trait HasherFunction: Send + Sync {
    fn hash_bytes(&self, data: &[u8]) -> u64;
}

impl<T> HasherFunction for T
where
    T: Fn(&[u8]) -> u64 + Send + Sync,
{
    fn hash_bytes(&self, data: &[u8]) -> u64 {
        self(data)
    }
}

/// 双哈希函数对
///
/// 两个哈希函数种子相互独立，键的两个候选桶索引取
/// `H1 mod N` 与 `H2 mod N`。同一键在任意桶数下候选桶恒定。
#[derive(Clone)]
pub struct DoubleHasher {
    primary: Arc<dyn HasherFunction>,
    secondary: Arc<dyn HasherFunction>,
    fingerprint_generator: Arc<dyn FingerprintGenerator>,
}

impl DoubleHasher {
    /// 主哈希种子
    pub const PRIMARY_SEED: u64 = 0xdead_beef_dead_beef;
    /// 副哈希种子
    pub const SECONDARY_SEED: u64 = 0xabcd_efab_cdef_1234;

    /// 创建新双哈希对
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self::new_with_generator(Arc::new(DefaultFingerprintGenerator), algorithm)
    }

    /// 使用指定指纹生成器创建
    pub fn new_with_generator(
        fingerprint_generator: Arc<dyn FingerprintGenerator>,
        algorithm: HashAlgorithm,
    ) -> Self {
        let primary = Self::build_hasher_function(algorithm, Self::PRIMARY_SEED);
        let secondary = Self::build_hasher_function(algorithm, Self::SECONDARY_SEED);

        Self {
            primary,
            secondary,
            fingerprint_generator,
        }
    }

    /// 构建哈希函数
    fn build_hasher_function(algorithm: HashAlgorithm, seed: u64) -> Arc<dyn HasherFunction> {
        match algorithm {
            HashAlgorithm::AHash => {
                let state = RandomState::with_seed(seed as usize);
                Arc::new(move |data: &[u8]| {
                    let mut hasher = state.build_hasher();
                    data.hash(&mut hasher);
                    hasher.finish()
                })
            }
            HashAlgorithm::XxHash => {
                Arc::new(move |data: &[u8]| {
                    let mut hasher = twox_hash::XxHash64::with_seed(seed);
                    data.hash(&mut hasher);
                    hasher.finish()
                })
            }
            HashAlgorithm::Default => {
                Arc::new(move |data: &[u8]| {
                    let mut hasher = std::collections::hash_map::DefaultHasher::new();
                    // DefaultHasher不可播种，先写入种子区分主副
                    seed.hash(&mut hasher);
                    data.hash(&mut hasher);
                    hasher.finish()
                })
            }
        }
    }

    /// 计算键在给定桶数下的两个候选桶索引
    pub fn candidate_buckets(&self, key_bytes: &[u8], n_buckets: usize) -> (usize, usize) {
        let h1 = self.primary.hash_bytes(key_bytes) as usize % n_buckets;
        let h2 = self.secondary.hash_bytes(key_bytes) as usize % n_buckets;

        // 两个候选桶重合时顺移一位，保证候选桶始终成对且互异
        if h1 == h2 {
            (h1, (h2 + 1) % n_buckets)
        } else {
            (h1, h2)
        }
    }

    /// 计算键的指纹
    ///
    /// 空键映射到零指纹（空槽位编码），非空键恒为非零。
    pub fn fingerprint<K: FixedKey>(&self, key: &K) -> Fingerprint {
        if key.is_empty() {
            return Fingerprint::zero();
        }
        self.fingerprint_generator.generate(key.as_bytes())
    }
}
