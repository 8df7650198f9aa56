//! 统一错误处理 - 表能产生的全部错误类型
//!
//! 重复插入与查找未命中不是错误，以布尔结果返回；这里只保留真正的故障。

/// 级联Cuckoo哈希表可能发生的错误
#[derive(Debug, thiserror::Error)]
pub enum CuckooError {
    #[error("内存分配失败 (大小: {size}, 对齐: {align})")]
    AllocationFailed {
        size: usize,
        align: usize,
    },

    #[error("无效配置: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("值大小不匹配 (期望: {expected}, 实际: {actual})")]
    ValueSizeMismatch {
        expected: usize,
        actual: usize,
    },
}

impl CuckooError {
    /// 判断错误是否可恢复
    ///
    /// 分配失败后表不变，调用方可以释放内存后重试；配置错误和
    /// 值大小错误需要修正调用方代码。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }
}
