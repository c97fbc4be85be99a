//! Branch table management.

mod table;

pub use table::{validate_branch_name, BranchTable, MAIN_BRANCH};
