//! SDK 生命周期管理
//!
//! 管理 App 前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// 获取已注册的 Hook 数量
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败只记录错误，继续执行其他 Hook
    pub async fn notify_background(&self) {
        info!("🔄 通知所有模块：App 切换到后台");
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
            }
        }
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) {
        info!("🔄 通知所有模块：App 切换到前台");
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        foreground: AtomicUsize,
        background: AtomicUsize,
        fail_foreground: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.background.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            if self.fail_foreground {
                return Err(crate::error::VitalSyncError::Other("hook 故障".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_notified_despite_failures() {
        let failing = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            background: AtomicUsize::new(0),
            fail_foreground: true,
        });
        let healthy = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            background: AtomicUsize::new(0),
            fail_foreground: false,
        });

        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());
        assert_eq!(manager.hook_count(), 2);

        // 前一个 Hook 失败不影响后续 Hook 执行
        manager.notify_foreground().await;
        assert_eq!(failing.foreground.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.foreground.load(Ordering::SeqCst), 1);

        manager.notify_background().await;
        assert_eq!(healthy.background.load(Ordering::SeqCst), 1);
    }
}
