//! Intake of uploaded model artifacts into the run queue.

use crate::backends::ModelSelector;
use crate::error::MlError;
use chrono::NaiveDateTime;
use dlchan_core::RunQueue;
use dlchan_core::config::ChallengeConfig;
use std::path::Path;

/// What an accepted submission turned into.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    /// Stored file name, also the queue reference.
    pub reference: String,
    pub backend: String,
    /// Queue length after enqueueing, this submission included.
    pub waiting: usize,
}

/// Reduce an uploaded file name to a safe, flat ASCII name.
///
/// Path separators become spaces, whitespace runs become `_`, characters
/// outside `[A-Za-z0-9._-]` are dropped and leading or trailing `.`/`_` are
/// trimmed. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let flattened: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Store an uploaded artifact and queue it for evaluation.
///
/// Refused when the challenge has ended or the artifact exceeds the size
/// limit. An artifact no backend recognises is deleted again and the
/// aggregated rejection message is returned as [`MlError::Rejected`].
pub fn submit_artifact(
    file_name: &str,
    bytes: &[u8],
    upload_dir: &Path,
    selector: &ModelSelector,
    queue: &RunQueue,
    challenge: &ChallengeConfig,
    now: NaiveDateTime,
) -> Result<SubmissionReceipt, MlError> {
    if challenge.is_closed(now) {
        return Err(MlError::DeadlinePassed);
    }
    let size = bytes.len() as u64;
    if size > challenge.max_model_size {
        return Err(MlError::TooLarge {
            size,
            limit: challenge.max_model_size,
        });
    }
    let reference = sanitize_file_name(file_name)
        .ok_or_else(|| MlError::invalid_input("No file selected"))?;

    std::fs::create_dir_all(upload_dir)?;
    let path = upload_dir.join(&reference);
    std::fs::write(&path, bytes)?;

    let Some(model) = selector.from_file(&path) else {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Could not remove rejected artifact");
        }
        tracing::info!(reference, "Submission rejected");
        return Err(MlError::Rejected(selector.invalid_message()));
    };

    queue.enqueue(&reference)?;
    let waiting = queue.waiting()?.len();
    tracing::info!(reference, backend = model.backend(), waiting, "Submission queued");
    Ok(SubmissionReceipt {
        reference,
        backend: model.backend().to_string(),
        waiting,
    })
}
