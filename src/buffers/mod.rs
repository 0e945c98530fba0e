pub mod allocator;

pub use allocator::Allocator;
