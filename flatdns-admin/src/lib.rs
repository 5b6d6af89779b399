pub mod handlers;
pub mod server;

pub use server::{build_admin_router, AdminState};
