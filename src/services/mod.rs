// Catalog and cart
pub mod cart;
pub mod catalog;

// Checkout and order lifecycle
pub mod checkout;
pub mod order_number;
pub mod order_status;
pub mod orders;
pub mod pricing;

// Payment settlement
pub mod payments;

// Reporting
pub mod reports;
