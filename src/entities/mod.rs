pub mod cart;
pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod order_sequence;
pub mod product;
pub mod shipping_address;
