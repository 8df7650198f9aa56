//! 级联Cuckoo哈希表核心实现
//!
//! 一个表由若干层子表组成：第0层在构造时创建，后续层在踢出预算
//! 耗尽时惰性追加，每层容量是前一层的4倍。查找按层序扫描，深层命中
//! 会被提升回第0层；插入从第0层开始，逐层吸收溢出。全表一把互斥锁，
//! `lookup` 返回的 `Finding` 在存活期间持有该锁。

use crate::{
    error::CuckooError,
    hash::{DoubleHasher, HashAlgorithm},
    map::subtable::{InsertStatus, PlacedSlot, Subtable},
    types::{DefaultCompare, FixedKey, KeyCompare},
};
use std::sync::{Arc, Mutex, MutexGuard};

/// 每层插入重试次数
///
/// 单次踢出预算耗尽并不证明该层已满；换一条随机游走路径再试的代价
/// 远低于向下一层溢出。
const INSERT_RETRIES: usize = 3;

/// 哈希表配置
#[derive(Clone, Debug)]
pub struct CuckooMapConfig {
    /// 第0层桶数
    pub initial_buckets: usize,
    /// 值字节数
    pub value_size: usize,
    /// 值对齐
    pub value_align: usize,
    /// 单层单次插入的最大踢出次数
    pub max_kicks: usize,
    /// 哈希算法
    pub hash_algorithm: HashAlgorithm,
}

impl Default for CuckooMapConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 1024,
            value_size: 8,
            value_align: 8,
            max_kicks: 32,
            hash_algorithm: HashAlgorithm::AHash,
        }
    }
}

impl CuckooMapConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), CuckooError> {
        if self.initial_buckets == 0 {
            return Err(CuckooError::InvalidConfig {
                reason: "初始桶数必须大于零".into(),
            });
        }
        if self.value_align == 0 || !self.value_align.is_power_of_two() {
            return Err(CuckooError::InvalidConfig {
                reason: format!("值对齐必须是2的幂: {}", self.value_align),
            });
        }
        Ok(())
    }
}

/// 哈希表统计信息
#[derive(Debug, Default, Clone)]
pub struct CuckooMapStats {
    pub size: u64,
    pub layer_count: usize,
    pub slot_capacity: usize,
    pub load_factor: f32,
    pub promote_count: u64,
    pub spill_count: u64,
    pub kick_count: u64,
}

/// 槽位定位结果（内部）
struct Located<K> {
    key: *mut K,
    value: *mut u8,
    layer: i32,
}

impl<K> Located<K> {
    fn null() -> Self {
        Self {
            key: std::ptr::null_mut(),
            value: std::ptr::null_mut(),
            layer: -1,
        }
    }
}

/// 级联插入结果（内部）
enum CascadeOutcome {
    Placed,
    Duplicate,
}

/// 互斥锁保护的内部状态
struct MapCore<K: FixedKey, C: KeyCompare<K> + Clone> {
    /// 层序子表，只追加不删除
    tables: Vec<Subtable<K, C>>,
    nr_used: u64,
    promote_count: u64,
    spill_count: u64,
    /// 插入级联的携带缓冲，构造时按值大小分配一次
    carry_buf: Vec<u8>,
    /// 提升路径的值拷贝缓冲
    promote_buf: Vec<u8>,
}

/// 级联Cuckoo哈希表
///
/// 键按字节拷贝存放（`FixedKey`），值是构造时指定大小与对齐的字节块。
/// 所有公开操作都在内部互斥锁下执行，线程安全；`lookup` 返回的
/// [`Finding`] 持锁直至析构，期间可以原地修改槽内的键与值。键只允许
/// 在不改变哈希、指纹和相等类的前提下修改。
///
/// 同一线程在 `Finding` 存活期间再调用本表的任何方法会死锁（粗粒度
/// 锁，不支持自重入）。
pub struct CuckooMap<K: FixedKey, C: KeyCompare<K> + Clone = DefaultCompare> {
    core: Mutex<MapCore<K, C>>,
    hasher: Arc<DoubleHasher>,
    comp: C,
    config: CuckooMapConfig,
}

impl<K: FixedKey + PartialEq> CuckooMap<K, DefaultCompare> {
    /// 创建哈希表：第0层桶数与值布局由参数给定
    pub fn new(
        initial_buckets: usize,
        value_size: usize,
        value_align: usize,
    ) -> Result<Self, CuckooError> {
        let config = CuckooMapConfig {
            initial_buckets,
            value_size,
            value_align,
            ..CuckooMapConfig::default()
        };
        Self::with_config(config, DefaultCompare)
    }

    /// 按类型V的大小与对齐创建哈希表
    pub fn for_value<V>(initial_buckets: usize) -> Result<Self, CuckooError> {
        Self::new(
            initial_buckets,
            std::mem::size_of::<V>(),
            std::mem::align_of::<V>(),
        )
    }
}

impl<K: FixedKey, C: KeyCompare<K> + Clone> CuckooMap<K, C> {
    /// 使用完整配置与自定义相等关系创建
    pub fn with_config(config: CuckooMapConfig, comp: C) -> Result<Self, CuckooError> {
        config.validate()?;
        let hasher = Arc::new(DoubleHasher::new(config.hash_algorithm));

        let first = Subtable::new(
            config.initial_buckets,
            config.value_size,
            config.value_align,
            config.max_kicks,
            Arc::clone(&hasher),
            comp.clone(),
        )?;

        Ok(Self {
            core: Mutex::new(MapCore {
                tables: vec![first],
                nr_used: 0,
                promote_count: 0,
                spill_count: 0,
                carry_buf: vec![0; config.value_size],
                promote_buf: vec![0; config.value_size],
            }),
            hasher,
            comp,
            config,
        })
    }

    /// 查找键，返回持锁的Finding
    ///
    /// 未命中时 `found()` 为假，但Finding仍持有锁，调用方可以借同一个
    /// Finding链式执行后续操作。深层命中会先被提升回第0层，Finding
    /// 指向提升后的落位槽。
    pub fn lookup(&self, key: &K) -> Finding<'_, K, C> {
        let mut guard = self.core.lock().unwrap();
        let located = self.inner_lookup(&mut guard, key);
        Finding {
            guard: Some(guard),
            owner: Some(self),
            key: located.key,
            value: located.value,
            layer: located.layer,
        }
    }

    /// 复用既有Finding执行查找
    ///
    /// Finding若绑定在别的表上，会先释放旧表的锁再取得本表的锁。
    pub fn lookup_with<'a>(&'a self, key: &K, f: &mut Finding<'a, K, C>) -> bool {
        self.rebind(f);
        let guard = f.guard.as_mut().expect("重绑后Finding必持锁");
        let located = self.inner_lookup(guard, key);
        f.key = located.key;
        f.value = located.value;
        f.layer = located.layer;
        f.found()
    }

    /// 插入键值对
    ///
    /// 返回 `Ok(true)` 表示插入完成，`Ok(false)` 表示相等键已存在且表
    /// 未改动。追加溢出层的内存分配失败以 `Err` 返回。空键禁止插入。
    pub fn insert(&self, key: K, value: &[u8]) -> Result<bool, CuckooError> {
        debug_assert!(!key.is_empty(), "禁止插入空键");
        self.check_value_len(value)?;
        let mut guard = self.core.lock().unwrap();
        Ok(self.inner_insert(&mut guard, key, value)?.is_some())
    }

    /// 复用既有Finding执行插入
    ///
    /// 成功时Finding指向落位槽并记录所在层；重复键时Finding为未命中态。
    pub fn insert_with<'a>(
        &'a self,
        key: K,
        value: &[u8],
        f: &mut Finding<'a, K, C>,
    ) -> Result<bool, CuckooError> {
        debug_assert!(!key.is_empty(), "禁止插入空键");
        self.check_value_len(value)?;
        self.rebind(f);
        let guard = f.guard.as_mut().expect("重绑后Finding必持锁");
        match self.inner_insert(guard, key, value) {
            Ok(Some(located)) => {
                f.key = located.key;
                f.value = located.value;
                f.layer = located.layer;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// 删除键，返回是否删除了一个对
    pub fn remove(&self, key: &K) -> bool {
        let mut guard = self.core.lock().unwrap();
        let core = &mut *guard;
        for layer in 0..core.tables.len() {
            if let Some((kp, _)) = core.tables[layer].lookup(key) {
                unsafe {
                    core.tables[layer].remove_at(kp);
                }
                core.nr_used -= 1;
                return true;
            }
        }
        false
    }

    /// 删除Finding当前指向的对，无需重新查找
    ///
    /// Finding若绑定在别的表上，重绑后指针已被清空，返回假。
    pub fn remove_with<'a>(&'a self, f: &mut Finding<'a, K, C>) -> bool {
        let same = f.owner.map_or(false, |m| std::ptr::eq(m, self));
        if !same {
            self.rebind(f);
            return false;
        }
        if f.key.is_null() {
            return false;
        }
        let guard = f.guard.as_mut().expect("绑定的Finding必持锁");
        let core = &mut **guard;
        unsafe {
            core.tables[f.layer as usize].remove_at(f.key);
        }
        core.nr_used -= 1;
        f.key = std::ptr::null_mut();
        f.value = std::ptr::null_mut();
        f.layer = -1;
        true
    }

    /// 当前存放的对数
    pub fn nr_used(&self) -> u64 {
        self.core.lock().unwrap().nr_used
    }

    /// 当前层数
    pub fn layer_count(&self) -> usize {
        self.core.lock().unwrap().tables.len()
    }

    /// 键当前所在的层（不触发提升），用于白盒观察
    pub fn layer_of(&self, key: &K) -> Option<usize> {
        let guard = self.core.lock().unwrap();
        guard
            .tables
            .iter()
            .position(|table| table.lookup(key).is_some())
    }

    /// 统计快照
    pub fn stats(&self) -> CuckooMapStats {
        let guard = self.core.lock().unwrap();
        let slot_capacity: usize = guard.tables.iter().map(|t| t.slot_capacity()).sum();
        let kick_count: u64 = guard.tables.iter().map(|t| t.kick_count()).sum();
        CuckooMapStats {
            size: guard.nr_used,
            layer_count: guard.tables.len(),
            slot_capacity,
            load_factor: if slot_capacity == 0 {
                0.0
            } else {
                guard.nr_used as f32 / slot_capacity as f32
            },
            promote_count: guard.promote_count,
            spill_count: guard.spill_count,
            kick_count,
        }
    }

    /// 值字节数
    pub fn value_size(&self) -> usize {
        self.config.value_size
    }

    /// 值对齐
    pub fn value_align(&self) -> usize {
        self.config.value_align
    }

    /// 当前配置
    pub fn config(&self) -> &CuckooMapConfig {
        &self.config
    }

    fn check_value_len(&self, value: &[u8]) -> Result<(), CuckooError> {
        if value.len() != self.config.value_size {
            return Err(CuckooError::ValueSizeMismatch {
                expected: self.config.value_size,
                actual: value.len(),
            });
        }
        Ok(())
    }

    /// 把Finding绑定到本表：必要时换锁，指针一律清空
    fn rebind<'a>(&'a self, f: &mut Finding<'a, K, C>) {
        let same = f.owner.map_or(false, |m| std::ptr::eq(m, self));
        if !same {
            f.guard = None;
            f.guard = Some(self.core.lock().unwrap());
            f.owner = Some(self);
        }
        f.key = std::ptr::null_mut();
        f.value = std::ptr::null_mut();
        f.layer = -1;
    }

    /// 层序查找；深层命中触发提升
    fn inner_lookup(&self, core: &mut MapCore<K, C>, key: &K) -> Located<K> {
        for layer in 0..core.tables.len() {
            if let Some((kp, vp)) = core.tables[layer].lookup(key) {
                if layer == 0 {
                    return Located {
                        key: kp,
                        value: vp,
                        layer: 0,
                    };
                }
                return self.promote(core, layer, kp, vp);
            }
        }
        Located::null()
    }

    /// 提升：把深层命中的对搬回第0层起的级联
    fn promote(&self, core: &mut MapCore<K, C>, layer: usize, kp: *mut K, vp: *mut u8) -> Located<K> {
        let key_copy = unsafe { *kp };
        let mut buf = std::mem::take(&mut core.promote_buf);
        unsafe {
            std::ptr::copy_nonoverlapping(vp, buf.as_mut_ptr(), self.config.value_size);
        }
        let old_fp = unsafe { core.tables[layer].remove_at(kp) };
        core.nr_used -= 1;

        let result = self.inner_insert(core, key_copy, &buf);
        core.promote_buf = buf;

        match result {
            Ok(Some(located)) => {
                core.promote_count += 1;
                located
            }
            Ok(None) => {
                // 刚删除的键不可能重复；相等关系异常时按未命中处理
                log_error!("promotion hit a duplicate, comparator is not an equivalence");
                Located::null()
            }
            Err(_err) => {
                // 追加溢出层失败：原槽位只被清了指纹，仍为空则原地恢复
                if unsafe { core.tables[layer].restore_at(kp, old_fp) } {
                    core.nr_used += 1;
                    log_warn!("promotion aborted ({}), entry kept in layer {}", _err, layer);
                    Located {
                        key: kp,
                        value: vp,
                        layer: layer as i32,
                    }
                } else {
                    log_error!("promotion aborted ({}) and slot was reused, entry dropped", _err);
                    Located::null()
                }
            }
        }
    }

    /// 级联插入：逐层吸收，必要时追加新层
    ///
    /// `Ok(Some(..))` 插入完成并给出落位槽；`Ok(None)` 重复键；`Err`
    /// 表示追加溢出层失败；此时若原键仍在手上，键集合与计数都未变。
    fn inner_insert(
        &self,
        core: &mut MapCore<K, C>,
        key: K,
        value: &[u8],
    ) -> Result<Option<Located<K>>, CuckooError> {
        // 全级联查重：相等键可能停留在更深的层，必须在任何踢出发生前发现
        if core.tables.iter().any(|table| table.lookup(&key).is_some()) {
            return Ok(None);
        }

        let original = key;
        let mut carried = key;
        let mut carry = std::mem::take(&mut core.carry_buf);
        carry.copy_from_slice(value);

        let mut placed = PlacedSlot::null();
        let mut placed_layer: i32 = -1;

        let outcome = self.cascade_insert(
            core,
            &mut carried,
            &mut carry,
            &original,
            &mut placed,
            &mut placed_layer,
        );
        core.carry_buf = carry;

        match outcome {
            Ok(CascadeOutcome::Placed) => {
                core.nr_used += 1;
                Ok(Some(Located {
                    key: placed.key,
                    value: placed.value,
                    layer: placed_layer,
                }))
            }
            Ok(CascadeOutcome::Duplicate) => Ok(None),
            Err(err) => {
                if placed.is_set() && !self.comp.eq(&carried, &original) {
                    // 原键已落位，丢失的是手上被逐出的别的对；计数一增
                    // 一减相抵，保持与占用槽位数一致
                    log_error!("overflow layer allocation failed, evicted pair dropped: {}", err);
                    Ok(Some(Located {
                        key: placed.key,
                        value: placed.value,
                        layer: placed_layer,
                    }))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn cascade_insert(
        &self,
        core: &mut MapCore<K, C>,
        carried: &mut K,
        carry: &mut [u8],
        original: &K,
        placed: &mut PlacedSlot<K>,
        placed_layer: &mut i32,
    ) -> Result<CascadeOutcome, CuckooError> {
        let mut layer = 0usize;
        while layer < core.tables.len() {
            for _ in 0..INSERT_RETRIES {
                let before = placed.key;
                let status = core.tables[layer].insert(carried, carry, original, placed);
                if placed.key != before {
                    *placed_layer = layer as i32;
                }
                match status {
                    InsertStatus::Duplicate => return Ok(CascadeOutcome::Duplicate),
                    InsertStatus::Placed => return Ok(CascadeOutcome::Placed),
                    InsertStatus::Spilled => {
                        core.spill_count += 1;
                        log_debug!("layer {} kick budget exhausted", layer);
                    }
                }
            }
            layer += 1;
        }

        // 所有层都溢出：追加4倍容量的新层，新层上循环到放置成功为止
        let last_buckets = core.tables[core.tables.len() - 1].bucket_count();
        let new_buckets = last_buckets.checked_mul(4).ok_or(CuckooError::InvalidConfig {
            reason: "层容量溢出".into(),
        })?;
        let table = Subtable::new(
            new_buckets,
            self.config.value_size,
            self.config.value_align,
            self.config.max_kicks,
            Arc::clone(&self.hasher),
            self.comp.clone(),
        )?;
        core.tables.push(table);
        log_info!(
            "appended overflow layer {} with {} buckets",
            core.tables.len() - 1,
            new_buckets
        );

        let back = core.tables.len() - 1;
        loop {
            let before = placed.key;
            let status = core.tables[back].insert(carried, carry, original, placed);
            if placed.key != before {
                *placed_layer = back as i32;
            }
            match status {
                InsertStatus::Duplicate => return Ok(CascadeOutcome::Duplicate),
                InsertStatus::Placed => return Ok(CascadeOutcome::Placed),
                InsertStatus::Spilled => {
                    core.spill_count += 1;
                }
            }
        }
    }
}

/// 查找/插入结果句柄，同时充当表锁的守卫
///
/// Finding身兼两职：其一，它是表互斥锁的持有者，析构（或重绑到别的
/// 表）时释放；其二，它描述一次查找的结果，命中时 `key()` / `value()`
/// 给出指向槽内存储的引用，可以原地修改。键只允许在哈希、指纹和相等
/// 类都不变的前提下修改，值可在 `value_size` 字节内任意改写。
///
/// 禁止拷贝；移动转移锁的所有权。`next()` / `get()` 是多值变体的占位
/// 接口，本表中恒为假。
pub struct Finding<'a, K: FixedKey, C: KeyCompare<K> + Clone = DefaultCompare> {
    guard: Option<MutexGuard<'a, MapCore<K, C>>>,
    owner: Option<&'a CuckooMap<K, C>>,
    key: *mut K,
    value: *mut u8,
    layer: i32,
}

impl<'a, K: FixedKey, C: KeyCompare<K> + Clone> Finding<'a, K, C> {
    /// 创建未绑定任何表的Finding
    pub fn unbound() -> Self {
        Self {
            guard: None,
            owner: None,
            key: std::ptr::null_mut(),
            value: std::ptr::null_mut(),
            layer: -1,
        }
    }

    /// 是否命中
    pub fn found(&self) -> bool {
        self.owner.is_some() && !self.key.is_null()
    }

    /// 命中槽位的键
    pub fn key(&self) -> Option<&K> {
        if self.key.is_null() {
            return None;
        }
        Some(unsafe { &*self.key })
    }

    /// 命中槽位的键（可变）
    ///
    /// 修改不得改变键的哈希、指纹或相等类。
    pub fn key_mut(&mut self) -> Option<&mut K> {
        if self.key.is_null() {
            return None;
        }
        Some(unsafe { &mut *self.key })
    }

    /// 命中槽位的值字节
    pub fn value(&self) -> Option<&[u8]> {
        let owner = self.owner?;
        if self.value.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.value, owner.config.value_size) })
    }

    /// 命中槽位的值字节（可变）
    pub fn value_mut(&mut self) -> Option<&mut [u8]> {
        let owner = self.owner?;
        if self.value.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.value, owner.config.value_size) })
    }

    /// 命中槽位所在的层；未命中时为 -1
    pub fn layer(&self) -> i32 {
        self.layer
    }

    /// 多值变体的占位接口，本表恒为假
    pub fn next(&mut self) -> bool {
        false
    }

    /// 多值变体的占位接口，本表恒为假
    pub fn get(&mut self, _pos: i32) -> bool {
        false
    }
}
