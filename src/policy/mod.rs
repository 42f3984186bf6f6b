//! Role-based access policy: typed roles and the route authorization table.

pub mod roles;
pub mod table;

pub use roles::{InvalidRoleName, RoleName, RoleSet};
pub use table::{Chain, RouteNotFound, RouteRule, RouteTable, RouteTableError};
