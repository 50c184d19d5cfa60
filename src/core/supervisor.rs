//! 任务监管：根取消令牌 + 每任务子令牌
//!
//! 关闭时取消根令牌即可让所有后台循环与在途任务感知；单任务取消只影响它自己的子令牌。

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根令牌（后台循环使用）
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 为任务创建子令牌；同 id 已存在时替换
    pub fn child_token(&self, task_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.tasks.lock().insert(task_id.to_string(), token.clone());
        token
    }

    /// 取消单个任务；返回是否找到
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, task_id: &str) {
        self.tasks.lock().remove(task_id);
    }

    /// 取消全部（关闭时）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_task() {
        let sup = TaskSupervisor::new();
        let a = sup.child_token("a");
        let b = sup.child_token("b");

        assert!(sup.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.cancel("missing"));
    }

    #[test]
    fn test_cancel_all_reaches_children() {
        let sup = TaskSupervisor::new();
        let a = sup.child_token("a");
        sup.cancel_all();
        assert!(a.is_cancelled());
        assert!(sup.is_shutdown());
    }
}
