pub(crate) mod arena;
pub(crate) mod big_heap;
pub(crate) mod bitmap;
pub(crate) mod global;
pub(crate) mod integration;
pub(crate) mod meshing;
pub(crate) mod miniheap;
pub(crate) mod rng;
pub(crate) mod size_class;
pub(crate) mod span;
pub(crate) mod stats;
pub(crate) mod stw;
pub(crate) mod tracker;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_init! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
