pub mod live;
pub mod order_types;
pub mod safety;
