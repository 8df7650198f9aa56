// src/map/subtable.rs
//! 子表 - 平坦槽位数组、候选桶探测与有界随机游走驱逐

use crate::{
    error::CuckooError,
    hash::DoubleHasher,
    memory::{SlotLayout, TableArena},
    types::{Fingerprint, FixedKey, KeyCompare},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;

/// 每桶槽位数
pub const SLOTS_PER_BUCKET: usize = 4;

/// 子表插入三态结果
///
/// - `Duplicate`: 相等键已存在，表未改动
/// - `Placed`: 在踢出预算内完成放置
/// - `Spilled`: 踢出预算耗尽，溢出对留在调用方的键/值缓冲里
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Duplicate,
    Placed,
    Spilled,
}

/// 原键落点记录 - 级联层借此把最终槽位指针穿回Finding
pub struct PlacedSlot<K> {
    pub(crate) key: *mut K,
    pub(crate) value: *mut u8,
}

impl<K> PlacedSlot<K> {
    /// 创建空记录
    pub fn null() -> Self {
        Self {
            key: std::ptr::null_mut(),
            value: std::ptr::null_mut(),
        }
    }

    /// 是否已记录落点
    pub fn is_set(&self) -> bool {
        !self.key.is_null()
    }

    /// 落点槽位的键指针
    pub fn key_ptr(&self) -> *mut K {
        self.key
    }

    /// 落点槽位的值指针
    pub fn value_ptr(&self) -> *mut u8 {
        self.value
    }
}

/// 级联中的单层子表
///
/// 一次性连续分配 `N × SLOTS_PER_BUCKET` 个槽位，槽位内为
/// (指纹 | 键 | 填充 | 值字节)。子表自身不持锁，所有访问由
/// 外层 `CuckooMap` 的互斥锁串行化。
///
/// 不变式：每个占用槽位都可以从其键的两个候选桶之一到达。
pub struct Subtable<K: FixedKey, C: KeyCompare<K> + Clone> {
    arena: TableArena,
    slot_layout: SlotLayout,
    n_buckets: usize,
    max_kicks: usize,
    hasher: Arc<DoubleHasher>,
    comp: C,
    rng: SmallRng,
    kick_count: u64,
    _key_marker: std::marker::PhantomData<K>,
}

impl<K: FixedKey, C: KeyCompare<K> + Clone> Subtable<K, C> {
    /// 创建子表，分配失败时返回错误且不留下部分状态
    pub fn new(
        n_buckets: usize,
        value_size: usize,
        value_align: usize,
        max_kicks: usize,
        hasher: Arc<DoubleHasher>,
        comp: C,
    ) -> Result<Self, CuckooError> {
        if n_buckets == 0 {
            return Err(CuckooError::InvalidConfig {
                reason: "桶数必须大于零".into(),
            });
        }

        let slot_layout = SlotLayout::for_key::<K>(value_size, value_align)?;
        let size = n_buckets
            .checked_mul(SLOTS_PER_BUCKET)
            .and_then(|slots| slots.checked_mul(slot_layout.stride()))
            .ok_or(CuckooError::InvalidConfig {
                reason: format!("桶数过大导致容量溢出: {}", n_buckets),
            })?;
        let arena = TableArena::allocate(size, slot_layout.align())?;

        Ok(Self {
            arena,
            slot_layout,
            n_buckets,
            max_kicks,
            hasher,
            comp,
            rng: SmallRng::from_entropy(),
            kick_count: 0,
            _key_marker: std::marker::PhantomData,
        })
    }

    /// 桶数
    pub fn bucket_count(&self) -> usize {
        self.n_buckets
    }

    /// 槽位总数
    pub fn slot_capacity(&self) -> usize {
        self.n_buckets * SLOTS_PER_BUCKET
    }

    /// 累计踢出次数
    pub fn kick_count(&self) -> u64 {
        self.kick_count
    }

    /// 统计占用槽位数
    pub fn count_occupied(&self) -> usize {
        let mut n = 0;
        for bucket in 0..self.n_buckets {
            for slot in 0..SLOTS_PER_BUCKET {
                unsafe {
                    if !self.fp_at(self.slot_base(bucket, slot)).is_zero() {
                        n += 1;
                    }
                }
            }
        }
        n
    }

    /// 查找键，命中时返回指向槽内键与值存储的裸指针
    ///
    /// 先扫第一候选桶的全部槽位，再扫第二候选桶；指纹匹配后才比较键。
    pub fn lookup(&self, key: &K) -> Option<(*mut K, *mut u8)> {
        let fp = self.hasher.fingerprint(key);
        if fp.is_zero() {
            // 空键的指纹是空槽位编码，直接按未命中处理
            return None;
        }
        let (b1, b2) = self.hasher.candidate_buckets(key.as_bytes(), self.n_buckets);
        self.probe_bucket(b1, fp, key)
            .or_else(|| self.probe_bucket(b2, fp, key))
    }

    /// 插入携带对
    ///
    /// 携带对存放在调用方的 `key` / `value` 缓冲里；返回 `Spilled` 时
    /// 缓冲中留下的是被逐出的溢出对，由级联层送往下一层。每当一个按
    /// `comp` 等于 `original` 的对被写入槽位，`placed` 更新为该槽位的
    /// 指针（原键穿引）。
    pub fn insert(
        &mut self,
        key: &mut K,
        value: &mut [u8],
        original: &K,
        placed: &mut PlacedSlot<K>,
    ) -> InsertStatus {
        debug_assert_eq!(value.len(), self.slot_layout.value_size());

        let fp = self.hasher.fingerprint(key);
        let (b1, b2) = self.hasher.candidate_buckets(key.as_bytes(), self.n_buckets);

        // 阶段1：扫完两个候选桶，查重并记录空槽位
        let mut empty_slot: Option<(usize, usize)> = None;
        for &bucket in &[b1, b2] {
            for slot in 0..SLOTS_PER_BUCKET {
                unsafe {
                    let base = self.slot_base(bucket, slot);
                    let slot_fp = self.fp_at(base);
                    if slot_fp.is_zero() {
                        if empty_slot.is_none() {
                            empty_slot = Some((bucket, slot));
                        }
                    } else if slot_fp == fp && self.comp.eq(&*self.key_at(base), key) {
                        return InsertStatus::Duplicate;
                    }
                }
            }
        }

        if let Some((bucket, slot)) = empty_slot {
            unsafe {
                self.write_slot(bucket, slot, fp, key, value, original, placed);
            }
            return InsertStatus::Placed;
        }

        // 阶段2：有界随机游走
        self.random_walk(b1, b2, fp, key, value, original, placed)
    }

    /// 随机游走驱逐，预算耗尽即溢出
    fn random_walk(
        &mut self,
        mut b1: usize,
        mut b2: usize,
        mut fp: Fingerprint,
        key: &mut K,
        value: &mut [u8],
        original: &K,
        placed: &mut PlacedSlot<K>,
    ) -> InsertStatus {
        for _ in 0..self.max_kicks {
            let home = if self.rng.gen_bool(0.5) { b1 } else { b2 };
            let victim = self.rng.gen_range(0..SLOTS_PER_BUCKET);
            self.kick_count += 1;

            unsafe {
                let base = self.slot_base(home, victim);

                // 携带对与受害者整体互换
                let victim_fp = self.fp_at(base);
                self.set_fp(base, fp);
                fp = victim_fp;

                let kp = self.key_at(base);
                std::mem::swap(&mut *kp, key);

                let vp = self.value_at(base);
                std::ptr::swap_nonoverlapping(
                    value.as_mut_ptr(),
                    vp,
                    self.slot_layout.value_size(),
                );

                if self.comp.eq(&*kp, original) {
                    placed.key = kp;
                    placed.value = vp;
                }
            }

            // 受害者成为新的携带对；先试它的另一个候选桶
            let (vb1, vb2) = self.hasher.candidate_buckets(key.as_bytes(), self.n_buckets);
            let target = if vb1 == home { vb2 } else { vb1 };
            if let Some(slot) = self.find_empty(target) {
                unsafe {
                    self.write_slot(target, slot, fp, key, value, original, placed);
                }
                return InsertStatus::Placed;
            }
            b1 = target;
            b2 = home;
        }

        InsertStatus::Spilled
    }

    /// 删除槽位：只清零指纹，键值字节保留
    ///
    /// # Safety
    /// `key_ptr` 必须是本子表 `lookup`/`insert` 在同一持锁期内交出的键指针。
    pub unsafe fn remove_at(&mut self, key_ptr: *mut K) -> Fingerprint {
        let base = (key_ptr as *mut u8).sub(self.slot_layout.key_offset());
        let fp = self.fp_at(base);
        self.set_fp(base, Fingerprint::zero());
        fp
    }

    /// 恢复被 `remove_at` 清零的槽位（提升回滚路径）
    ///
    /// 槽位在清零后可能已被后续踢出占用；仅当它仍为空时恢复指纹，
    /// 返回是否恢复成功。
    ///
    /// # Safety
    /// 与 `remove_at` 相同，且槽位的键值字节在清零后未被改写。
    pub unsafe fn restore_at(&mut self, key_ptr: *mut K, fp: Fingerprint) -> bool {
        let base = (key_ptr as *mut u8).sub(self.slot_layout.key_offset());
        if !self.fp_at(base).is_zero() {
            return false;
        }
        self.set_fp(base, fp);
        true
    }

    fn probe_bucket(&self, bucket: usize, fp: Fingerprint, key: &K) -> Option<(*mut K, *mut u8)> {
        for slot in 0..SLOTS_PER_BUCKET {
            unsafe {
                let base = self.slot_base(bucket, slot);
                if self.fp_at(base) == fp {
                    let kp = self.key_at(base);
                    if self.comp.eq(&*kp, key) {
                        return Some((kp, self.value_at(base)));
                    }
                }
            }
        }
        None
    }

    fn find_empty(&self, bucket: usize) -> Option<usize> {
        for slot in 0..SLOTS_PER_BUCKET {
            unsafe {
                if self.fp_at(self.slot_base(bucket, slot)).is_zero() {
                    return Some(slot);
                }
            }
        }
        None
    }

    unsafe fn write_slot(
        &mut self,
        bucket: usize,
        slot: usize,
        fp: Fingerprint,
        key: &K,
        value: &[u8],
        original: &K,
        placed: &mut PlacedSlot<K>,
    ) {
        let base = self.slot_base(bucket, slot);
        self.set_fp(base, fp);
        let kp = self.key_at(base);
        std::ptr::write(kp, *key);
        let vp = self.value_at(base);
        std::ptr::copy_nonoverlapping(value.as_ptr(), vp, self.slot_layout.value_size());

        if self.comp.eq(key, original) {
            placed.key = kp;
            placed.value = vp;
        }
    }

    #[inline]
    unsafe fn slot_base(&self, bucket: usize, slot: usize) -> *mut u8 {
        debug_assert!(bucket < self.n_buckets && slot < SLOTS_PER_BUCKET);
        self.arena
            .as_ptr()
            .add((bucket * SLOTS_PER_BUCKET + slot) * self.slot_layout.stride())
    }

    #[inline]
    unsafe fn fp_at(&self, base: *mut u8) -> Fingerprint {
        Fingerprint::new(*(base as *const u16))
    }

    #[inline]
    unsafe fn set_fp(&self, base: *mut u8, fp: Fingerprint) {
        *(base as *mut u16) = fp.as_u16();
    }

    #[inline]
    unsafe fn key_at(&self, base: *mut u8) -> *mut K {
        base.add(self.slot_layout.key_offset()) as *mut K
    }

    #[inline]
    unsafe fn value_at(&self, base: *mut u8) -> *mut u8 {
        base.add(self.slot_layout.value_offset())
    }
}

// 单元测试
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::types::DefaultCompare;

    const VALUE_SIZE: usize = 8;

    fn test_subtable(n_buckets: usize) -> Subtable<u64, DefaultCompare> {
        let hasher = Arc::new(DoubleHasher::new(HashAlgorithm::AHash));
        Subtable::new(n_buckets, VALUE_SIZE, 8, 16, hasher, DefaultCompare).unwrap()
    }

    fn insert_one(
        sub: &mut Subtable<u64, DefaultCompare>,
        key: u64,
        value: u64,
    ) -> (InsertStatus, u64, [u8; VALUE_SIZE]) {
        let mut k = key;
        let mut v = value.to_ne_bytes();
        let mut placed = PlacedSlot::null();
        let status = sub.insert(&mut k, &mut v, &key, &mut placed);
        (status, k, v)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut sub = test_subtable(16);

        let (status, _, _) = insert_one(&mut sub, 7, 700);
        assert_eq!(status, InsertStatus::Placed);

        let (kp, vp) = sub.lookup(&7).expect("键应命中");
        unsafe {
            assert_eq!(*kp, 7);
            let bytes = std::slice::from_raw_parts(vp, VALUE_SIZE);
            assert_eq!(bytes, &700u64.to_ne_bytes());
        }
        assert!(sub.lookup(&8).is_none());
        assert_eq!(sub.count_occupied(), 1);
    }

    #[test]
    fn test_duplicate_detected() {
        let mut sub = test_subtable(16);

        assert_eq!(insert_one(&mut sub, 1, 100).0, InsertStatus::Placed);
        assert_eq!(insert_one(&mut sub, 1, 200).0, InsertStatus::Duplicate);
        assert_eq!(sub.count_occupied(), 1);

        // 原值未被覆盖
        let (_, vp) = sub.lookup(&1).unwrap();
        unsafe {
            assert_eq!(
                std::slice::from_raw_parts(vp, VALUE_SIZE),
                &100u64.to_ne_bytes()
            );
        }
    }

    #[test]
    fn test_remove_and_restore() {
        let mut sub = test_subtable(16);
        insert_one(&mut sub, 42, 4200);

        let (kp, _) = sub.lookup(&42).unwrap();
        let fp = unsafe { sub.remove_at(kp) };
        assert!(!fp.is_zero());
        assert!(sub.lookup(&42).is_none());
        assert_eq!(sub.count_occupied(), 0);

        // 清零只动指纹，恢复后键值原样可见
        assert!(unsafe { sub.restore_at(kp, fp) });
        let (kp2, vp2) = sub.lookup(&42).unwrap();
        assert_eq!(kp, kp2);
        unsafe {
            assert_eq!(
                std::slice::from_raw_parts(vp2, VALUE_SIZE),
                &4200u64.to_ne_bytes()
            );
        }
    }

    #[test]
    fn test_spill_leaves_carried_pair() {
        // 2桶×4槽位=8个槽位，第9个键必然溢出
        let mut sub = test_subtable(2);
        let mut inserted = Vec::new();

        let mut spilled: Option<(u64, [u8; VALUE_SIZE])> = None;
        for key in 1u64..=64 {
            let (status, carried_key, carried_value) = insert_one(&mut sub, key, key * 10);
            match status {
                InsertStatus::Placed => inserted.push(key),
                InsertStatus::Spilled => {
                    spilled = Some((carried_key, carried_value));
                    break;
                }
                InsertStatus::Duplicate => panic!("不应出现重复"),
            }
        }

        let (carried_key, carried_value) = spilled.expect("槽位耗尽后必须溢出");
        assert_eq!(sub.count_occupied(), 8);

        // 溢出对是某个真实的对，且已不在表内
        assert!(sub.lookup(&carried_key).is_none());
        let expected = carried_key * 10;
        assert_eq!(carried_value, expected.to_ne_bytes());

        // 其余的键全部可达
        let mut present = 0;
        for key in 1u64..=64 {
            if sub.lookup(&key).is_some() {
                present += 1;
            }
        }
        assert_eq!(present, 8);
    }

    #[test]
    fn test_placed_threading() {
        let mut sub = test_subtable(16);

        let original: u64 = 99;
        let mut k = original;
        let mut v = 9900u64.to_ne_bytes();
        let mut placed = PlacedSlot::null();
        let status = sub.insert(&mut k, &mut v, &original, &mut placed);

        assert_eq!(status, InsertStatus::Placed);
        assert!(placed.is_set());
        unsafe {
            assert_eq!(*placed.key, original);
            assert_eq!(
                std::slice::from_raw_parts(placed.value, VALUE_SIZE),
                &9900u64.to_ne_bytes()
            );
        }
    }

    #[test]
    fn test_restore_skipped_when_reoccupied() {
        // 2桶表中每个键的候选桶覆盖全部槽位，填满后原槽位必然被重占
        let mut sub = test_subtable(2);
        for key in 1u64..=8 {
            assert_eq!(insert_one(&mut sub, key, key * 100).0, InsertStatus::Placed);
        }

        let (kp, _) = sub.lookup(&3).unwrap();
        let fp = unsafe { sub.remove_at(kp) };
        assert_eq!(insert_one(&mut sub, 9, 900).0, InsertStatus::Placed);
        assert_eq!(sub.count_occupied(), 8);

        assert!(!unsafe { sub.restore_at(kp, fp) });
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let hasher = Arc::new(DoubleHasher::new(HashAlgorithm::AHash));
        let result: Result<Subtable<u64, DefaultCompare>, _> =
            Subtable::new(0, 8, 8, 16, hasher, DefaultCompare);
        assert!(result.is_err());
    }

    #[test]
    fn test_kick_counter_grows_under_pressure() {
        let mut sub = test_subtable(2);
        for key in 1u64..=32 {
            let _ = insert_one(&mut sub, key, key);
        }
        assert!(sub.kick_count() > 0, "满表插入必然发生踢出");
    }
}
