//! Task graph generation and execution backends.

mod executor;
mod task_graph;

pub use executor::{
    makeflow_batchlog_path, makeflow_log_path, parse_makeflow_log, Executor, MakeflowExecutor,
    ShellExecutor, TaskCompletion, TaskStatus, WorkflowExecutor,
};
pub use task_graph::{
    capture_name, sanitize_image_name, SolverPaths, Task, TaskGraph, TaskGraphBuilder,
    TaskGraphError, CAPTURE_EXTENSION, SOLVE_FIELD_FLAGS,
};
