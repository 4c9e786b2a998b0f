use crate::allocator::{AllocatedBuffer, MemorySpace};
use crate::dtype::DType;
use crate::graph::{Graph, GraphBuilder, GraphError};
use crate::prepack::{PackedBuffers, PrepackedBlobTable};
use crate::tensor::{TensorError, TensorValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("External data alignment must be a nonzero power of two, got {0}")]
    BadAlignment(u64),
    #[error("Unsupported artifact format version {0}")]
    UnsupportedFormatVersion(u32),
    #[error("External data segment at {offset}+{length} is out of bounds ({file_len} byte file)")]
    SegmentOutOfBounds {
        offset: u64,
        length: u64,
        file_len: u64,
    },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    TensorError(#[from] TensorError),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct SavedSegment {
    offset: u64,
    length: u64,
}

#[derive(Serialize, Deserialize)]
struct SavedInitializer {
    name: String,
    dtype: DType,
    shape: Vec<u64>,
    segment: SavedSegment,
}

#[derive(Serialize, Deserialize)]
struct SavedPrepackEntry {
    signature: String,
    buffers: Vec<SavedSegment>,
}

#[derive(Serialize, Deserialize)]
struct SavedPrepackedWeight {
    weight: String,
    entries: Vec<SavedPrepackEntry>,
}

#[derive(Serialize, Deserialize)]
struct SavedNode {
    name: Option<String>,
    op_type: String,
    domain: String,
    since_version: usize,
    inputs: Vec<String>,
    outputs: Vec<String>,
    subgraphs: HashMap<String, SavedGraph>,
}

#[derive(Serialize, Deserialize)]
struct SavedGraph {
    inputs: Vec<String>,
    outputs: Vec<String>,
    outer_scope: Vec<String>,
    nodes: Vec<SavedNode>,
    initializers: Vec<SavedInitializer>,
}

#[derive(Serialize, Deserialize)]
struct SavedModel {
    format_version: u32,
    ir_version: usize,
    alignment: u64,
    external_data: String,
    graph: SavedGraph,
    prepacked: Vec<SavedPrepackedWeight>,
}

#[derive(Clone, Debug)]
pub struct ModelSavingOptions {
    /// Byte boundary external-data segments start on. Power of two.
    pub alignment: u64,
}

impl Default for ModelSavingOptions {
    fn default() -> Self {
        Self { alignment: 4 }
    }
}

/// Appends aligned segments to the external-data image.
struct SegmentWriter {
    data: Vec<u8>,
    alignment: u64,
}

impl SegmentWriter {
    fn new(alignment: u64) -> Self {
        Self {
            data: Vec::new(),
            alignment,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> SavedSegment {
        let alignment = self.alignment as usize;
        let padded = self.data.len().next_multiple_of(alignment);
        self.data.resize(padded, 0);
        let segment = SavedSegment {
            offset: padded as u64,
            length: bytes.len() as u64,
        };
        self.data.extend_from_slice(bytes);
        segment
    }
}

/// The external data file conventionally sits next to the model under the
/// model's stem, suffixed with the artifact-cache placement id when one is
/// configured.
pub fn external_data_file_name(model_path: &Path, cache_id: Option<&str>) -> String {
    let stem = model_path
        .file_stem()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    match cache_id {
        Some(id) => format!("{stem}.{id}.bin"),
        None => format!("{stem}.bin"),
    }
}

/// Writes the model as a JSON manifest plus an external binary data file.
/// Initializer bytes land in the external file unchanged; prepacked blobs
/// from `prepacked` (the root plan's recorded table) become additional
/// aligned segments with a per-weight side table in the manifest.
pub fn save_model(
    graph: &Graph,
    prepacked: Option<&PrepackedBlobTable>,
    model_path: &Path,
    external_data_name: &str,
    options: &ModelSavingOptions,
) -> Result<(), ArtifactError> {
    if !options.alignment.is_power_of_two() {
        return Err(ArtifactError::BadAlignment(options.alignment));
    }

    let mut writer = SegmentWriter::new(options.alignment);
    let saved_graph = save_graph(graph, &mut writer);
    let saved_prepacked = match prepacked {
        Some(table) => save_prepacked(table, &mut writer),
        None => Vec::new(),
    };

    let manifest = SavedModel {
        format_version: ARTIFACT_FORMAT_VERSION,
        ir_version: graph.ir_version(),
        alignment: options.alignment,
        external_data: external_data_name.to_string(),
        graph: saved_graph,
        prepacked: saved_prepacked,
    };

    let external_path = model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(external_data_name);
    std::fs::write(&external_path, &writer.data)?;
    let file = std::io::BufWriter::new(std::fs::File::create(model_path)?);
    serde_json::to_writer_pretty(file, &manifest)?;
    log::info!(
        "saved model to {} ({} external-data bytes)",
        model_path.display(),
        writer.data.len()
    );
    Ok(())
}

fn save_graph(graph: &Graph, writer: &mut SegmentWriter) -> SavedGraph {
    let mut initializer_names: Vec<&String> = graph.get_initializers().keys().collect();
    initializer_names.sort();
    let initializers = initializer_names
        .into_iter()
        .map(|name| {
            let value = &graph.get_initializers()[name];
            SavedInitializer {
                name: name.clone(),
                dtype: value.dtype(),
                shape: value.shape().to_vec(),
                segment: writer.append(value.raw_data()),
            }
        })
        .collect();

    let nodes = graph
        .get_nodes()
        .iter()
        .map(|node| {
            let mut attrs: Vec<&String> = node.get_subgraphs().keys().collect();
            attrs.sort();
            let subgraphs = attrs
                .into_iter()
                .map(|attr| {
                    (
                        attr.clone(),
                        save_graph(&node.get_subgraphs()[attr], writer),
                    )
                })
                .collect();
            SavedNode {
                name: node.name().map(|x| x.to_string()),
                op_type: node.op_type().to_string(),
                domain: node.domain().to_string(),
                since_version: node.since_version(),
                inputs: node.get_inputs().to_vec(),
                outputs: node.get_outputs().to_vec(),
                subgraphs,
            }
        })
        .collect();

    let mut outer_scope: Vec<String> = graph.get_outer_scope_names().iter().cloned().collect();
    outer_scope.sort();

    SavedGraph {
        inputs: graph.get_inputs().to_vec(),
        outputs: graph.get_outputs().to_vec(),
        outer_scope,
        nodes,
        initializers,
    }
}

fn save_prepacked(
    table: &PrepackedBlobTable,
    writer: &mut SegmentWriter,
) -> Vec<SavedPrepackedWeight> {
    let mut weights: Vec<_> = table.iter_weights().collect();
    weights.sort_by(|a, b| a.0.cmp(b.0));
    weights
        .into_iter()
        .map(|(weight, blobs)| {
            let mut signatures: Vec<&String> = blobs.keys().collect();
            signatures.sort();
            let entries = signatures
                .into_iter()
                .map(|signature| SavedPrepackEntry {
                    signature: signature.clone(),
                    buffers: blobs[signature]
                        .iter()
                        .map(|buffer| writer.append(buffer.as_slice()))
                        .collect(),
                })
                .collect();
            SavedPrepackedWeight {
                weight: weight.clone(),
                entries,
            }
        })
        .collect()
}

/// A model reconstructed from disk: the graph with bit-identical
/// initializers, and the recovered prepacked-blob side table.
pub struct LoadedModel {
    pub graph: Graph,
    pub prepacked: Arc<PrepackedBlobTable>,
}

pub fn load_model(model_path: &Path) -> Result<LoadedModel, ArtifactError> {
    let file = std::io::BufReader::new(std::fs::File::open(model_path)?);
    let manifest: SavedModel = serde_json::from_reader(file)?;
    if manifest.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(ArtifactError::UnsupportedFormatVersion(
            manifest.format_version,
        ));
    }

    let external_path = model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&manifest.external_data);
    let data = std::fs::read(&external_path)?;

    let graph = load_graph(&manifest.graph, manifest.ir_version, &data)?;

    let mut table = PrepackedBlobTable::new();
    for weight in &manifest.prepacked {
        for entry in &weight.entries {
            let mut buffers = PackedBuffers::new();
            for segment in &entry.buffers {
                buffers.push(AllocatedBuffer::from_vec(
                    MemorySpace::cpu(),
                    segment_slice(&data, segment)?.to_vec(),
                ));
            }
            table.record(&weight.weight, &entry.signature, Arc::new(buffers));
        }
    }

    Ok(LoadedModel {
        graph,
        prepacked: Arc::new(table),
    })
}

fn load_graph(saved: &SavedGraph, ir_version: usize, data: &[u8]) -> Result<Graph, ArtifactError> {
    let mut builder = GraphBuilder::new(ir_version);
    for name in &saved.inputs {
        builder.add_input(name);
    }
    for name in &saved.outputs {
        builder.add_output(name);
    }
    for name in &saved.outer_scope {
        builder.add_outer_scope_name(name);
    }
    for node in &saved.nodes {
        let mut subgraphs = HashMap::new();
        for (attr, sub) in &node.subgraphs {
            subgraphs.insert(attr.clone(), load_graph(sub, ir_version, data)?);
        }
        builder.add_node_full(
            node.name.clone(),
            &node.op_type,
            &node.domain,
            node.since_version,
            node.inputs.clone(),
            node.outputs.clone(),
            subgraphs,
        );
    }
    for init in &saved.initializers {
        let bytes = segment_slice(data, &init.segment)?;
        builder.add_initializer(
            &init.name,
            TensorValue::from_raw_data(bytes, init.dtype, init.shape.clone())?,
        )?;
    }
    Ok(builder.get_inner())
}

fn segment_slice<'a>(data: &'a [u8], segment: &SavedSegment) -> Result<&'a [u8], ArtifactError> {
    let start = segment.offset as usize;
    let end = start.checked_add(segment.length as usize);
    match end {
        Some(end) if end <= data.len() => Ok(&data[start..end]),
        _ => Err(ArtifactError::SegmentOutOfBounds {
            offset: segment.offset,
            length: segment.length,
            file_len: data.len() as u64,
        }),
    }
}
