/*!
# Overview
sfs3 is a bulk, resumable, integrity-checked transfer engine for file trees
stored in S3-compatible object storage.

Every file is stored as a content object under `data/<path>` together with a
small `meta/<path>/md5sum` sidecar holding the MD5 of the plaintext, so a
round-trip can always be verified end to end. Optional GPG encryption keeps
the plaintext digest in the sidecar while ciphertext goes on the wire.

## Features
- Push and pull of whole trees with bounded concurrency, progress reporting
  and skipped/transferred/aborted accounting.
- Skip-if-unchanged logic (`stat` and `md5sum` policies) so repeated runs only
  move what changed.
- Concurrent multipart uploads with re-readable part payloads; downloads
  resume after a stall with a ranged, `If-Match`-guarded request.
- MD5 verification on every download, with bounded retry and exponential
  backoff.

## As a library
The sfs3 CLI is a thin wrapper over this crate. Build a [`config::Config`]
from parsed arguments, create the shared client with
[`storage::client_builder::create_client`], then drive
[`pipeline::BulkOrchestrator`] (trees) or the single-object pipelines in
[`pipeline`].
*/

pub use config::Config;
pub use config::args::CliArgs;

pub mod config;
pub mod crypto;
pub mod pipeline;
pub mod progress;
pub mod storage;
pub mod types;
