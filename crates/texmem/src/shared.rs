//! Board-locked entry points
//!
//! [`SharedTextureMemory`] puts a manager behind a mutex (the board lock) so
//! several owners can drive one device. Each method takes the lock for the
//! whole operation; [`SharedTextureMemory::lock`] hands out the guard to run
//! several operations under one acquisition.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::error::Result;
use crate::manager::TextureMemoryManager;
use crate::residency::{Target, TextureId, TextureStore};
use crate::stats::{TexMemStats, UnitUsage};
use crate::upload::TextureUploader;

/// Cloneable, thread-safe handle to a [`TextureMemoryManager`]
#[derive(Debug, Clone)]
pub struct SharedTextureMemory {
    manager: Arc<Mutex<TextureMemoryManager>>,
}

impl SharedTextureMemory {
    pub fn new(manager: TextureMemoryManager) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
        }
    }

    /// Take the board lock.
    ///
    /// A lock poisoned by a panicking holder is recovered; the free lists are
    /// only mutated through operations that leave them consistent.
    pub fn lock(&self) -> MutexGuard<'_, TextureMemoryManager> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the board lock without blocking.
    ///
    /// Returns `None` if another owner currently holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, TextureMemoryManager>> {
        match self.manager.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn request_residency<S, U>(
        &self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        hint: Option<Target>,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.lock().request_residency(store, uploader, id, hint)
    }

    pub fn release_residency<S: TextureStore + ?Sized>(
        &self,
        store: &mut S,
        id: TextureId,
    ) -> Result<()> {
        self.lock().release_residency(store, id)
    }

    pub fn free_texture<S: TextureStore + ?Sized>(
        &self,
        store: &mut S,
        id: TextureId,
    ) -> Result<()> {
        self.lock().free_texture(store, id)
    }

    pub fn mark_dirty<S, U>(
        &self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        level: u8,
        row_start: u32,
        row_count: u32,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.lock().mark_dirty(store, uploader, id, level, row_start, row_count)
    }

    pub fn flush_all<S, U>(&self, store: &mut S, uploader: &mut U) -> usize
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.lock().flush_all(store, uploader)
    }

    pub fn reload_level<S, U>(
        &self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        level: u8,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.lock().reload_level(store, uploader, id, level)
    }

    pub fn restore_all_bound<S, U>(&self, store: &mut S, uploader: &mut U) -> Result<usize>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.lock().restore_all_bound(store, uploader)
    }

    pub fn begin_frame(&self) -> u32 {
        self.lock().begin_frame()
    }

    pub fn advance_bind_counter(&self) -> u32 {
        self.lock().advance_bind_counter()
    }

    /// Get current statistics
    pub fn stats(&self) -> TexMemStats {
        self.lock().stats().clone()
    }

    pub fn usage(&self) -> Vec<UnitUsage> {
        self.lock().usage()
    }

    /// Recover the manager once this is the last handle.
    pub fn into_inner(self) -> std::result::Result<TextureMemoryManager, Self> {
        match Arc::try_unwrap(self.manager) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(manager) => Err(Self { manager }),
        }
    }
}

impl From<TextureMemoryManager> for SharedTextureMemory {
    fn from(manager: TextureMemoryManager) -> Self {
        Self::new(manager)
    }
}
