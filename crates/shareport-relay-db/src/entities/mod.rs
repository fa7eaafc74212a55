//! SeaORM models of the shareport tables

pub mod device_request;
pub mod team;
pub mod team_member;
pub mod tunnel;
pub mod user;

pub use device_request::Entity as DeviceRequest;
pub use team::Entity as Team;
pub use team_member::Entity as TeamMember;
pub use tunnel::Entity as Tunnel;
pub use user::Entity as User;

pub mod prelude {
    pub use super::device_request::Entity as DeviceRequest;
    pub use super::team::Entity as Team;
    pub use super::team_member::Entity as TeamMember;
    pub use super::tunnel::Entity as Tunnel;
    pub use super::user::Entity as User;
}
