//! Wire protocol with the external compiler worker.
//!
//! Newline-delimited JSON envelopes over the worker's stdio. Every
//! envelope carries the correlation id of the job it belongs to; the
//! Ready handshake uses id 0 and is echoed back as an acknowledgement.

use serde::{Deserialize, Serialize};

use crucible_resolve::CompilationJob;

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageBody {
    /// Compile request, host → worker.
    Compile(CompilePayload),
    /// Successful compilation, worker → host.
    Assembly(AssemblyPayload),
    /// Failed compilation, worker → host.
    Error { message: String },
    /// Terminal shutdown request, host → worker.
    Exit,
    /// Startup handshake, worker → host, echoed back as an ack.
    Ready,
}

/// A named file embedded in a compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilePayload {
    pub output_name: String,
    pub source_files: Vec<WireFile>,
    pub reference_files: Vec<WireFile>,
    pub target_kind: String,
    pub language_version: String,
    pub load_default_references: bool,
}

impl CompilePayload {
    /// Builds the compile request for a job, with the host's default
    /// target settings.
    pub fn for_job(job: &CompilationJob) -> Self {
        Self {
            output_name: job.name.clone(),
            source_files: job
                .sources
                .iter()
                .map(|file| WireFile {
                    name: file.name.clone(),
                    bytes: file.bytes.clone(),
                })
                .collect(),
            reference_files: job
                .references
                .iter()
                .map(|file| WireFile {
                    name: file.name.clone(),
                    bytes: file.bytes.clone(),
                })
                .collect(),
            target_kind: "library".to_string(),
            language_version: "latest".to_string(),
            load_default_references: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyPayload {
    /// Raw module byte image.
    pub bytes: Vec<u8>,
    /// Per-line diagnostic text accompanying a partial success.
    #[serde(default)]
    pub diagnostics: Option<String>,
}

/// Encodes an envelope as one wire line (JSON plus trailing newline).
pub fn encode_line(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes one wire line.
pub fn decode_line(line: &str) -> serde_json::Result<Envelope> {
    serde_json::from_str(line)
}
