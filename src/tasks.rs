//! Task threads: durable units of agent work with logs and dependencies.

pub mod store;

pub use store::{
    AgentTaskSummary, CreateTaskInput, LogQuery, Task, TaskFilter, TaskLogEntry, TaskLogType,
    TaskPriority, TaskStatus, TaskStore, TaskSummary, UpdateTaskInput,
};
