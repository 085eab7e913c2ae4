pub mod entitlements;
pub mod jwt;
