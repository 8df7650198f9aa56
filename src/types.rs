//! 核心类型定义 - 键契约、相等关系与指纹

use core::fmt;

/// 固定布局键特征
///
/// 表内键按字节拷贝，不调用构造/析构。实现者必须保证：
/// - `empty()` 返回规范空值，且 `is_empty()` 对其为真
/// - `as_bytes()` 的字节影像在键的生命周期内稳定（哈希与指纹都建立在其上）
/// - 空键禁止插入；调用方在插入前必须自行检查 `is_empty()`
pub trait FixedKey: Copy + Send + Sync + 'static {
    /// 规范空键
    fn empty() -> Self;

    /// 是否为空键
    fn is_empty(&self) -> bool;

    /// 获取键的字节影像
    fn as_bytes(&self) -> &[u8];
}

/// 键相等关系 - 由调用方提供
///
/// 对应构造参数中的比较器；表内只按此关系判等。
pub trait KeyCompare<K>: Send + Sync {
    /// 比较两个键
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// 默认相等关系 - 直接委托 `PartialEq`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCompare;

impl<K: PartialEq> KeyCompare<K> for DefaultCompare {
    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// 指纹类型 - 10位无符号整数
///
/// 零值保留表示空槽位；占用槽位的指纹恒非零（由生成器保证）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Fingerprint(u16);

impl Fingerprint {
    /// 10位掩码
    pub const MASK: u16 = 0x3FF;

    /// 创建新指纹 (只取低10位)
    pub const fn new(value: u16) -> Self {
        Self(value & Self::MASK)
    }

    /// 返回零指纹（表示空槽位）
    pub const fn zero() -> Self {
        Self(0)
    }

    /// 获取指纹值
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// 检查是否为零（空槽位）
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}", self.0)
    }
}

// 为内置整数类型实现FixedKey特征，零值为规范空键

impl FixedKey for u64 {
    fn empty() -> Self {
        0
    }

    fn is_empty(&self) -> bool {
        *self == 0
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const u64 as *const u8,
                std::mem::size_of::<u64>(),
            )
        }
    }
}

impl FixedKey for u32 {
    fn empty() -> Self {
        0
    }

    fn is_empty(&self) -> bool {
        *self == 0
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const u32 as *const u8,
                std::mem::size_of::<u32>(),
            )
        }
    }
}
