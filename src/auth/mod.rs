//! Authentication Module
//! Mission: Validate bearer tokens and scope every request to its user

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, AuthUser};
