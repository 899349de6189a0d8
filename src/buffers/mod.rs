pub mod buffer_pool;
pub mod growable_queue;
pub mod pooled_buffer;
pub mod ring_queue;
