use flexmount_runtime::TaskStatus;

/// Steps needed to take a container's task out of the way before the
/// container record itself can be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownPlan {
    /// Signal the task and wait for it to exit.
    pub kill: bool,
    pub delete_task: bool,
}

impl TeardownPlan {
    pub const CONTAINER_ONLY: Self = Self {
        kill: false,
        delete_task: false,
    };
}

/// Teardown for a task observed in `status`, or for no task at all.
///
/// Created and stopped tasks are deleted directly. Every other state is
/// signalled first, including paused and unknown ones.
pub fn plan_teardown(status: Option<TaskStatus>) -> TeardownPlan {
    match status {
        None => TeardownPlan::CONTAINER_ONLY,
        Some(status) => TeardownPlan {
            kill: !status.is_settled(),
            delete_task: true,
        },
    }
}
