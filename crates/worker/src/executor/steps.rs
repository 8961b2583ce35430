//! 上传/检查步骤的状态机
//!
//! 每个步骤对应一个独立的容器：`Pending → Doing → {Done | Failed | Skipped}`，
//! 失败后回到 `Pending` 重试，累计失败达到上限后永久 `Failed`。

use crate::roles::ContainerRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Doing,
    Done,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, StepState::Done | StepState::Failed | StepState::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub role: ContainerRole,
    pub state: StepState,
    pub attempts: u32,
}

impl Step {
    pub fn new(role: ContainerRole, enabled: bool) -> Self {
        Self {
            role,
            state: if enabled {
                StepState::Pending
            } else {
                StepState::Skipped
            },
            attempts: 0,
        }
    }

    /// 记一次失败；返回是否已经用尽重试次数
    pub fn record_failure(&mut self, max_attempts: u32) -> bool {
        self.attempts += 1;
        if self.attempts >= max_attempts {
            self.state = StepState::Failed;
            true
        } else {
            self.state = StepState::Pending;
            false
        }
    }

    /// 未开始的步骤直接跳过，已经开始的保持不变
    pub fn skip_if_pending(&mut self) {
        if self.state == StepState::Pending {
            self.state = StepState::Skipped;
        }
    }
}

/// 一次推进带来的变化
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    Started,
    Done { exit_code: i32, output: Option<String> },
    Retrying,
    Exhausted,
}

/// 一个产出文件的三条独立流水线
#[derive(Debug, Clone, PartialEq)]
pub struct FileSteps {
    pub name: String,
    pub size: Option<u64>,
    pub upload: Step,
    pub check: Step,
    pub check_upload: Step,
    pub check_result: Option<i32>,
    pub cleaned: bool,
}

impl FileSteps {
    pub fn new(name: String, size: Option<u64>, upload: bool, check: bool, check_upload: bool) -> Self {
        Self {
            upload: Step::new(ContainerRole::ZimUploader(name.clone()), upload),
            check: Step::new(ContainerRole::Checker(name.clone()), check),
            check_upload: Step::new(ContainerRole::CheckUploader(name.clone()), check && check_upload),
            name,
            size,
            check_result: None,
            cleaned: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.upload.state.is_resolved()
            && self.check.state.is_resolved()
            && self.check_upload.state.is_resolved()
    }

    /// 已上传，且检查被跳过或检查完成并且检查结果已上传（或无需上传）
    pub fn is_successful(&self) -> bool {
        let uploaded = matches!(self.upload.state, StepState::Done | StepState::Skipped);
        let checked = match self.check.state {
            StepState::Skipped => true,
            StepState::Done => matches!(
                self.check_upload.state,
                StepState::Done | StepState::Skipped
            ),
            _ => false,
        };
        uploaded && checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_until_exhausted() {
        let mut step = Step::new(ContainerRole::LogUploader, true);
        for _ in 0..4 {
            assert!(!step.record_failure(5));
            assert_eq!(step.state, StepState::Pending);
        }
        assert!(step.record_failure(5));
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.attempts, 5);
    }

    #[test]
    fn test_file_success_rules() {
        let mut file = FileSteps::new("a.zim".into(), Some(1), true, true, true);
        assert!(!file.is_resolved());

        file.upload.state = StepState::Done;
        file.check.state = StepState::Done;
        file.check_upload.state = StepState::Failed;
        assert!(file.is_resolved());
        assert!(!file.is_successful());

        file.check_upload.state = StepState::Done;
        assert!(file.is_successful());

        let unchecked = FileSteps::new("b.zim".into(), None, true, false, true);
        assert_eq!(unchecked.check_upload.state, StepState::Skipped);
        let mut unchecked = unchecked;
        unchecked.upload.state = StepState::Failed;
        assert!(unchecked.is_resolved());
        assert!(!unchecked.is_successful());
    }
}
