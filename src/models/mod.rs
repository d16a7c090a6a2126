pub mod parcel;
pub mod readings;
