//! Persisted load statistics in the `LBDatafile` JSON layout, optionally
//! zstd-compressed.

use std::path::{Path, PathBuf};

use async_compression::tokio::{bufread::ZstdDecoder, write::ZstdEncoder};
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{lb::PhaseStats, runtime::Runtime, Error, NodeId};

const ZSTD_MAGIC: u32 = 0xFD2F_B528;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LbDatafile {
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: Metadata,
    pub phases: Vec<Phase>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub rank: NodeId,
    pub num_nodes: NodeId,
    /// RFC 3339 time the file was written.
    pub generated: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Phase {
    pub id: u64,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub communications: Vec<Communication>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub resource: String,
    pub node: NodeId,
    /// Seconds spent in handlers.
    pub time: f64,
    pub entity: Entity,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub home: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub migratable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<Vec<u64>>,
}

impl Entity {
    fn object(id: u64) -> Self {
        Self {
            kind: "object".to_string(),
            id,
            home: None,
            migratable: None,
            collection_id: None,
            index: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Communication {
    #[serde(rename = "type")]
    pub kind: String,
    pub bytes: u64,
    pub messages: u64,
    pub from: Entity,
    pub to: Entity,
}

impl LbDatafile {
    pub(crate) fn build(rank: NodeId, num_nodes: NodeId, phases: &[&PhaseStats]) -> Self {
        let phases = phases
            .iter()
            .map(|phase| {
                let mut tasks: Vec<Task> = phase
                    .loads
                    .iter()
                    .map(|(id, load)| Task {
                        resource: "cpu".to_string(),
                        node: rank,
                        time: load.time.as_secs_f64(),
                        entity: Entity {
                            home: Some(load.home),
                            migratable: Some(true),
                            collection_id: Some(load.collection.raw()),
                            index: Some(load.index.coords().to_vec()),
                            ..Entity::object(*id)
                        },
                    })
                    .collect();
                tasks.sort_by_key(|t| t.entity.id);
                let mut communications: Vec<Communication> = phase
                    .comm
                    .all_edges()
                    .map(|(from, to, edge)| Communication {
                        kind: "SendRecv".to_string(),
                        bytes: edge.bytes,
                        messages: edge.messages,
                        from: Entity::object(from),
                        to: Entity::object(to),
                    })
                    .collect();
                communications.sort_by_key(|c| (c.from.id, c.to.id));
                Phase {
                    id: phase.id,
                    tasks,
                    communications,
                }
            })
            .collect();
        Self {
            kind: "LBDatafile".to_string(),
            metadata: Metadata {
                rank,
                num_nodes,
                generated: Utc::now().to_rfc3339(),
            },
            phases,
        }
    }
}

/// The file a node writes its statistics to inside `dir`.
pub fn stats_file(dir: &Path, node: NodeId, compressed: bool) -> PathBuf {
    match compressed {
        true => dir.join(format!("stats.{}.json.zst", node)),
        false => dir.join(format!("stats.{}.json", node)),
    }
}

/// Reads a statistics file, compressed or not.
pub async fn read_lb_stats(path: &Path) -> Result<LbDatafile, Error> {
    let raw = tokio::fs::read(path).await?;
    let json = if raw.len() >= 4 && LittleEndian::read_u32(&raw[..4]) == ZSTD_MAGIC {
        let mut decoder = ZstdDecoder::new(&raw[..]);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json).await?;
        json
    } else {
        raw
    };
    Ok(serde_json::from_slice(&json)?)
}

impl Runtime {
    /// Writes every recorded phase of this node to `dir` and returns the
    /// file written.
    pub async fn write_lb_stats(&mut self, dir: &Path) -> Result<PathBuf, Error> {
        let compress = self.config.lb_stats_compress;
        let data = LbDatafile::build(self.this_node(), self.num_nodes(), &self.lb_phases());
        let json = serde_json::to_vec_pretty(&data)?;
        tokio::fs::create_dir_all(dir).await?;
        let path = stats_file(dir, self.this_node(), compress);
        let file = tokio::fs::File::create(&path).await?;
        if compress {
            let mut encoder = ZstdEncoder::new(file);
            encoder.write_all(&json).await?;
            encoder.shutdown().await?;
        } else {
            let mut file = file;
            file.write_all(&json).await?;
            file.flush().await?;
        }
        debug!("wrote {} phases to {}", data.phases.len(), path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        collection::{CollectionProxy, Index},
        lb::{CommEdge, ElementLoad},
    };

    fn phase() -> PhaseStats {
        let mut phase = PhaseStats::new(3);
        phase.loads.insert(
            (1 << 40) | 2,
            ElementLoad {
                collection: CollectionProxy::from_raw(1),
                index: Index::d2(0, 2),
                home: 1,
                time: Duration::from_millis(250),
                invocations: 4,
            },
        );
        phase.comm.add_edge(
            (1 << 40) | 2,
            (1 << 40) | 3,
            CommEdge {
                bytes: 64,
                messages: 2,
            },
        );
        phase
    }

    #[test]
    fn layout_matches_the_datafile_format() {
        let phase = phase();
        let data = LbDatafile::build(1, 4, &[&phase]);
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], "LBDatafile");
        let task = &value["phases"][0]["tasks"][0];
        assert_eq!(value["phases"][0]["id"], 3);
        assert_eq!(task["time"], 0.25);
        assert_eq!(task["entity"]["type"], "object");
        assert_eq!(task["entity"]["index"], serde_json::json!([0, 2]));
        assert_eq!(task["entity"]["collection_id"], 1);
        let comm = &value["phases"][0]["communications"][0];
        assert_eq!(comm["type"], "SendRecv");
        assert_eq!(comm["bytes"], 64);
        assert_eq!(comm["to"]["id"], (1u64 << 40) | 3);
        assert!(comm["to"].get("home").is_none());
    }

    #[tokio::test]
    async fn both_encodings_read_back() {
        let dir = std::env::temp_dir().join(format!("dendrite-lb-{}", std::process::id()));
        let phase = phase();
        for compress in [false, true] {
            let data = LbDatafile::build(0, 1, &[&phase]);
            let json = serde_json::to_vec(&data).unwrap();
            tokio::fs::create_dir_all(&dir).await.unwrap();
            let path = stats_file(&dir, 0, compress);
            let mut file = tokio::fs::File::create(&path).await.unwrap();
            if compress {
                let mut encoder = ZstdEncoder::new(&mut file);
                encoder.write_all(&json).await.unwrap();
                encoder.shutdown().await.unwrap();
            } else {
                file.write_all(&json).await.unwrap();
            }
            file.flush().await.unwrap();
            drop(file);
            let back = read_lb_stats(&path).await.unwrap();
            assert_eq!(back, data);
        }
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
