//! `permsctl`: answers Perms Engine authorization questions from the shell.
//!
//! ```bash
//! permsctl --fixture clinic.yaml check --principal u1 --permission view_patients
//! permsctl --fixture clinic.yaml check --principal u2 --permission change_patients --object p1 --explain
//! permsctl --fixture clinic.yaml groups --node user:u1
//! PERMS_DATABASE_URL=postgres://localhost/perms permsctl validate
//! ```
//!
//! `check` exits 0 when allowed, 1 when denied and 2 when the store could not
//! answer.

pub mod cli;
pub mod commands;
pub mod fixture;
pub mod store;

pub use cli::{Cli, Command};
pub use commands::{Verdict, EXIT_ERROR};
pub use fixture::Fixture;
pub use store::Store;
