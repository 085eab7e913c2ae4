// quire-common: wire types shared by the live server and its clients.

pub mod protocol;
pub mod types;
