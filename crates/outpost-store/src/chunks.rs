//! Chunked upload reassembly.
//!
//! An upload starts with [`Database::get_new_file_id`], which reserves a
//! negative id with a marker row (`chunk = -1`). Fragments then arrive in any
//! order, possibly more than once. The call that observes the full set
//! concatenates it, stages the file and deletes the rows, all in one
//! transaction; every later call for the same id short-circuits.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use outpost_shared::Token;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use crate::codec::{format_timestamp, normalize_timestamp};
use crate::database::{Database, Txn};
use crate::error::{Result, StoreError};
use crate::models::{ChunkStatus, ChunkUpload, FileObject, MirrorObject};

const RESERVATION_CHUNK: i64 = -1;

fn image_dimensions(content_type: &str, payload: &[u8]) -> (Option<u32>, Option<u32>) {
    if !content_type.starts_with("image/") {
        return (None, None);
    }
    match image::load_from_memory(payload) {
        Ok(img) => (Some(img.width()), Some(img.height())),
        Err(e) => {
            warn!(content_type, error = %e, "could not read image dimensions");
            (None, None)
        }
    }
}

impl Txn<'_> {
    /// Token of the staged file that consumed `file_id`, if any.
    fn completed_upload(&self, file_id: i64) -> Result<Option<Token>> {
        let token: Option<String> = self
            .conn
            .query_row(
                "SELECT token FROM stage WHERE object_id = ?1 LIMIT 1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.map(Token::new).transpose()?)
    }

    fn received_chunks(&self, file_id: i64) -> Result<(u32, Option<u32>)> {
        let (received, total): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), MAX(total_chunks) FROM file_chunk WHERE id = ?1 AND chunk >= 0",
            params![file_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((received as u32, total.map(|t| t as u32)))
    }

    fn reserve_file_id(&self) -> Result<i64> {
        let id = -(self.allocate_sequence()? as i64);
        self.conn.execute(
            "INSERT INTO file_chunk (id, chunk, total_chunks, date_modified, data)
             VALUES (?1, ?2, 0, ?3, '')",
            params![id, RESERVATION_CHUNK, format_timestamp(Utc::now())],
        )?;
        Ok(id)
    }

    fn add_chunk(&self, upload: &ChunkUpload, max_chunk_size: usize) -> Result<ChunkStatus> {
        if upload.file_id >= 0 {
            return Err(StoreError::InvalidChunk(format!(
                "file id {} is not a reservation",
                upload.file_id
            )));
        }
        if upload.total_chunks == 0 || upload.chunk_index >= upload.total_chunks {
            return Err(StoreError::InvalidChunk(format!(
                "chunk {} of {}",
                upload.chunk_index, upload.total_chunks
            )));
        }
        if upload.data.len() > max_chunk_size {
            return Err(StoreError::InvalidChunk(format!(
                "chunk of {} bytes exceeds {max_chunk_size}",
                upload.data.len()
            )));
        }

        if let Some(token) = self.completed_upload(upload.file_id)? {
            debug!(file_id = upload.file_id, "chunk for completed upload ignored");
            return Ok(ChunkStatus::AlreadyComplete { token });
        }

        let known: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file_chunk WHERE id = ?1",
            params![upload.file_id],
            |row| row.get(0),
        )?;
        if known == 0 {
            return Err(StoreError::InvalidChunk(format!(
                "file id {} was never reserved",
                upload.file_id
            )));
        }
        if let (_, Some(total)) = self.received_chunks(upload.file_id)? {
            if total != upload.total_chunks {
                return Err(StoreError::InvalidChunk(format!(
                    "total changed from {total} to {}",
                    upload.total_chunks
                )));
            }
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO file_chunk (id, chunk, total_chunks, date_modified, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                upload.file_id,
                upload.chunk_index,
                upload.total_chunks,
                format_timestamp(Utc::now()),
                upload.data,
            ],
        )?;

        let (received, _) = self.received_chunks(upload.file_id)?;
        if received < upload.total_chunks {
            return Ok(ChunkStatus::Pending {
                received,
                total: upload.total_chunks,
            });
        }

        let token = self.reassemble(upload)?;
        Ok(ChunkStatus::Complete { token })
    }

    fn reassemble(&self, upload: &ChunkUpload) -> Result<Token> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM file_chunk WHERE id = ?1 AND chunk >= 0 ORDER BY chunk",
        )?;
        let mut encoded = String::new();
        for fragment in stmt.query_map(params![upload.file_id], |row| row.get::<_, String>(0))? {
            encoded.push_str(&fragment?);
        }

        let payload = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StoreError::InvalidChunk(format!("payload is not base64: {e}")))?;
        let (width, height) = image_dimensions(&upload.content_type, &payload);

        let token = Token::placeholder(upload.file_id.unsigned_abs());
        let file = MirrorObject::File(FileObject {
            token: token.clone(),
            object_id: upload.file_id,
            name: upload.file_name.clone(),
            content_type: upload.content_type.clone(),
            size: payload.len() as u64,
            width,
            height,
            referenced: true,
            date_modified: normalize_timestamp(Utc::now()),
        });
        self.record_snapshot(file, Some(&payload), None)?;

        self.conn.execute(
            "DELETE FROM file_chunk WHERE id = ?1",
            params![upload.file_id],
        )?;

        info!(
            file_id = upload.file_id,
            token = %token,
            bytes = payload.len(),
            chunks = upload.total_chunks,
            "upload reassembled"
        );
        Ok(token)
    }
}

impl Database {
    /// Reserve a negative id for a new upload.
    pub fn get_new_file_id(&mut self) -> Result<i64> {
        let id = self.write(|txn| txn.reserve_file_id())?;
        debug!(file_id = id, "upload id reserved");
        Ok(id)
    }

    /// Store one fragment; the fragment completing the set stages the file.
    pub fn add_chunk(&mut self, upload: &ChunkUpload) -> Result<ChunkStatus> {
        let max = self.config().max_chunk_size;
        self.write(|txn| txn.add_chunk(upload, max))
    }

    /// Progress of an upload, for polling. `None` for an unknown id.
    pub fn upload_progress(&self, file_id: i64) -> Result<Option<ChunkStatus>> {
        let view = self.view();
        if let Some(token) = view.completed_upload(file_id)? {
            return Ok(Some(ChunkStatus::AlreadyComplete { token }));
        }
        let reserved: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file_chunk WHERE id = ?1",
            params![file_id],
            |row| row.get(0),
        )?;
        if reserved == 0 {
            return Ok(None);
        }
        let (received, total) = view.received_chunks(file_id)?;
        Ok(Some(ChunkStatus::Pending {
            received,
            total: total.unwrap_or(0),
        }))
    }

    /// Drop every upload whose newest fragment is older than `retention`.
    pub fn purge_stale_chunks(&mut self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = format_timestamp(Utc::now() - retention);
        let purged = self.conn.execute(
            "DELETE FROM file_chunk WHERE id IN (
                SELECT id FROM file_chunk GROUP BY id HAVING MAX(date_modified) < ?1
             )",
            params![cutoff],
        )?;
        if purged > 0 {
            info!(rows = purged, "stale upload chunks purged");
        }
        Ok(purged)
    }
}
