//! Attachment transfer worker pool.
//!
//! A fixed-size pool of worker threads drains one rendezvous channel fed by
//! a single producer iterating the staged descriptors. Each worker performs
//! a multi-attempt download-then-store per descriptor; a descriptor that
//! exhausts its attempts is quarantined to the bad-attachments list and
//! excluded from the commit stage. Workers share the session counters via
//! atomic increments and need no other coordination - each descriptor is
//! processed by exactly one worker.

use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::blob::BlobMetadata;
use crate::error::Result;
use crate::model::FileAsset;

use super::context::{AttachmentDescriptor, BadAttachment, Counters, ImportContext};
use super::staging::lock;

/// Transfer every staged attachment. Returns once all workers have drained
/// the queue; propagates cancellation observed during the run.
///
/// # Errors
///
/// Returns [`crate::GantryError::Cancelled`] when the session was cancelled
/// mid-transfer, or an I/O error if a worker thread could not be spawned.
pub fn transfer_attachments(ctx: &ImportContext) -> Result<()> {
    let descriptors = ctx.attachments().values();
    Counters::set(&ctx.counters.attachments_total, descriptors.len());
    if descriptors.is_empty() {
        return Ok(());
    }

    let workers = ctx.settings().transfer.workers.clamp(1, descriptors.len());
    tracing::info!(
        session = %ctx.id,
        count = descriptors.len(),
        workers,
        "transferring attachments"
    );

    let (tx, rx) = sync_channel::<AttachmentDescriptor>(0);
    let rx = Arc::new(Mutex::new(rx));

    std::thread::scope(|s| -> Result<()> {
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            std::thread::Builder::new()
                .name(format!("attach-{index}"))
                .spawn_scoped(s, move || worker_loop(ctx, &rx))?;
        }

        for descriptor in descriptors {
            if ctx.is_finished() {
                break;
            }
            if tx.send(descriptor).is_err() {
                break;
            }
        }
        drop(tx);
        Ok(())
    })?;

    ctx.check_cancelled()
}

fn worker_loop(ctx: &ImportContext, rx: &Mutex<Receiver<AttachmentDescriptor>>) {
    loop {
        // Hold the receiver lock only while pulling work.
        let next = lock(rx).recv();
        let Ok(descriptor) = next else {
            break;
        };
        if ctx.is_finished() {
            continue;
        }
        transfer_one(ctx, &descriptor);
    }
}

fn transfer_one(ctx: &ImportContext, descriptor: &AttachmentDescriptor) {
    let attempts = ctx.settings().transfer.attempts;
    let delay = ctx.settings().transfer.retry_delay();
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if ctx.is_finished() {
            return;
        }
        match download_and_store(ctx, descriptor) {
            Ok(asset) => {
                ctx.record_stored_asset(asset);
                Counters::incr(&ctx.counters.attachments_done);
                tracing::debug!(
                    session = %ctx.id,
                    name = %descriptor.name,
                    asset = %descriptor.asset_id,
                    attempt,
                    "attachment stored"
                );
                return;
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    session = %ctx.id,
                    name = %descriptor.name,
                    attempt,
                    error = %last_error,
                    "attachment download failed"
                );
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }

    // Quarantine: reported to the caller, never committed.
    ctx.bad_attachments().push(BadAttachment {
        name: descriptor.name.clone(),
        source_key: descriptor.source.dedup_key(),
        reason: last_error,
    });
}

fn download_and_store(ctx: &ImportContext, descriptor: &AttachmentDescriptor) -> Result<FileAsset> {
    let (bytes, remote_type) = ctx.remote().fetch_content(descriptor.source.url())?;

    let content_type = remote_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| descriptor.content_type.clone());

    let metadata = BlobMetadata {
        workspace_id: ctx.workspace_id,
        project_id: ctx.project().map(|p| p.id),
        issue_id: Some(descriptor.issue_id),
        comment_id: descriptor.comment_id,
        source: descriptor.source.dedup_key(),
    };

    let stored = ctx.blobs().save(
        &mut bytes.as_slice(),
        bytes.len() as u64,
        descriptor.asset_id,
        &content_type,
        &metadata,
    )?;

    Ok(FileAsset {
        id: stored.id,
        workspace_id: ctx.workspace_id,
        name: descriptor.name.clone(),
        content_type,
        size: i64::try_from(stored.size).unwrap_or(i64::MAX),
        content_hash: Some(stored.content_hash),
        created_at: Utc::now(),
    })
}
