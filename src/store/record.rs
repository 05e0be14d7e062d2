//! Change-tracking wrappers around entities.
//!
//! [`Record`] remembers whether any field actually changed so that a pass
//! over unchanged remote data issues no writes. [`ForUpdate`] pairs a record
//! with the transaction it was read in; it must end in exactly one
//! [`ForUpdate::save`] or [`ForUpdate::close`], and dropping it rolls back.

use std::ops::{Deref, DerefMut};

use uuid::Uuid;

use super::{Entity, SourceEntity, StoreError};
use crate::db::{Database, DbError, Executor, Transaction};
use crate::types::Source;

#[derive(Debug, Clone)]
pub struct Record<E> {
    entity: E,
    modified: bool,
    persisted: bool,
}

impl<E: Entity> Record<E> {
    /// Wrap an entity that has never been written.
    pub fn new(entity: E) -> Self {
        Self {
            entity,
            modified: true,
            persisted: false,
        }
    }

    fn loaded(entity: E) -> Self {
        Self {
            entity,
            modified: false,
            persisted: true,
        }
    }

    pub async fn load(exec: &mut dyn Executor, id: Uuid) -> Result<Option<Self>, DbError> {
        Ok(super::find_by_id(exec, id).await?.map(Self::loaded))
    }

    /// Existing row for `(source, source_id)`, or a fresh unsaved entity.
    pub async fn find(
        exec: &mut dyn Executor,
        source: Source,
        source_id: &str,
    ) -> Result<Self, DbError>
    where
        E: SourceEntity,
    {
        Ok(match super::find_by_source(exec, source, source_id).await? {
            Some(entity) => Self::loaded(entity),
            None => Self::new(E::create(source, source_id)),
        })
    }

    /// Assign a field, marking the record modified only if the value differs.
    pub fn set<T: PartialEq>(&mut self, field: impl FnOnce(&mut E) -> &mut T, value: T) -> bool {
        let slot = field(&mut self.entity);
        if *slot == value {
            return false;
        }
        *slot = value;
        self.modified = true;
        true
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// True until the entity has been written once.
    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    pub fn into_inner(self) -> E {
        self.entity
    }

    /// Write pending changes with the entity's save policy. No-op when
    /// nothing changed.
    pub async fn save(&mut self, exec: &mut dyn Executor) -> Result<bool, StoreError> {
        if !self.modified {
            return Ok(false);
        }
        super::save(exec, &self.entity, E::SAVE_POLICY).await?;
        self.modified = false;
        self.persisted = true;
        Ok(true)
    }
}

impl<E> Deref for Record<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

/// A record read inside its own open transaction.
#[derive(Debug)]
pub struct ForUpdate<E> {
    record: Record<E>,
    tx: Transaction,
}

impl<E: Entity> ForUpdate<E> {
    /// Load by id, or `None` (with the transaction already closed).
    pub async fn load(db: &Database, id: Uuid) -> Result<Option<Self>, DbError> {
        let mut tx = db.begin().await?;
        match Record::load(&mut tx, id).await? {
            Some(record) => Ok(Some(Self { record, tx })),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Existing row for `(source, source_id)` or a fresh instance, held in a
    /// new transaction either way.
    pub async fn find(db: &Database, source: Source, source_id: &str) -> Result<Self, DbError>
    where
        E: SourceEntity,
    {
        let mut tx = db.begin().await?;
        let record = Record::find(&mut tx, source, source_id).await?;
        Ok(Self { record, tx })
    }

    /// The held transaction, for related reads and writes.
    pub fn tx(&mut self) -> &mut Transaction {
        &mut self.tx
    }

    /// Write pending changes and commit. A failed write rolls back.
    pub async fn save(self) -> Result<bool, StoreError> {
        let Self { mut record, mut tx } = self;
        let written = match record.save(&mut tx).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(table = E::TABLE, error = %rb, "Rollback after failed save failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;
        Ok(written)
    }

    /// Write only `columns` (inserting the row if it is missing) and commit.
    pub async fn update(self, columns: &[&str]) -> Result<(), StoreError> {
        let Self { record, mut tx } = self;
        if let Err(e) = super::update(&mut tx, &record.entity, columns).await {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(table = E::TABLE, error = %rb, "Rollback after failed update failed");
            }
            return Err(e);
        }
        tx.commit().await?;
        Ok(())
    }

    /// Roll back without writing.
    pub async fn close(self) -> Result<(), DbError> {
        self.tx.rollback().await
    }
}

impl<E> Deref for ForUpdate<E> {
    type Target = Record<E>;

    fn deref(&self) -> &Record<E> {
        &self.record
    }
}

impl<E> DerefMut for ForUpdate<E> {
    fn deref_mut(&mut self) -> &mut Record<E> {
        &mut self.record
    }
}
