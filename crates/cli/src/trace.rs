use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use texmem::{
    DeviceCaps, DirtyRegion, FreeRange, Placement, Target, TexMemConfig, TexMemError, TexMemStats,
    TextureId, TextureLayout, TextureMemoryManager, TextureResidency, TextureStore, TextureTable,
    UnitId, UnitUsage, UploadCall, UploadLog,
};

/// A recorded sequence of residency operations against one device
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trace {
    pub device: DeviceCaps,
    #[serde(default)]
    pub config: Option<TexMemConfig>,
    #[serde(default)]
    pub textures: Vec<TextureSpec>,
    #[serde(default)]
    pub ops: Vec<Op>,
}

#[derive(Debug, Deserialize)]
pub struct TextureSpec {
    pub id: TextureId,
    #[serde(flatten)]
    pub layout: TextureLayout,
    #[serde(default = "default_priority")]
    pub priority: f32,
    #[serde(default)]
    pub bound: bool,
}

fn default_priority() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Request {
        texture: TextureId,
        #[serde(default)]
        hint: Option<Target>,
    },
    Release {
        texture: TextureId,
    },
    Free {
        texture: TextureId,
    },
    Dirty {
        texture: TextureId,
        level: u8,
        row_start: u32,
        row_count: u32,
    },
    Reload {
        texture: TextureId,
        level: u8,
    },
    Flush,
    /// Start the next frame
    Frame,
    /// Bind to a sampler unit: advances the bind counter and stamps the texture
    Bind {
        texture: TextureId,
    },
    Unbind {
        texture: TextureId,
    },
    Priority {
        texture: TextureId,
        priority: f32,
    },
    Restore,
}

#[derive(Debug, Serialize)]
pub struct OpOutcome {
    pub index: usize,
    pub op: Op,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TextureReport {
    pub id: TextureId,
    pub placement: Placement,
    pub priority: f32,
    pub last_used_stamp: u32,
    pub pin_until_frame: u32,
    pub pool_affinity: Option<UnitId>,
    pub dirty: Option<DirtyRegion>,
}

#[derive(Debug, Serialize)]
pub struct UnitReport {
    #[serde(flatten)]
    pub usage: UnitUsage,
    pub utilization: f64,
    pub fragmentation: f64,
    pub ranges: Vec<FreeRange>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub outcomes: Vec<OpOutcome>,
    pub uploads: Vec<UploadCall>,
    pub textures: Vec<TextureReport>,
    pub units: Vec<UnitReport>,
    pub stats: TexMemStats,
}

impl Report {
    pub fn failed_ops(&self) -> usize {
        self.outcomes.iter().filter(|outcome| !outcome.ok).count()
    }
}

/// Replay `trace` against a fresh manager.
///
/// Recoverable errors are recorded per operation; a fatal one aborts the replay.
/// Textures with empty or oversized layouts are rejected up front.
pub fn replay(trace: Trace, config: TexMemConfig) -> Result<Report> {
    let mut manager = TextureMemoryManager::new(trace.device, config)
        .context("failed to set up texture memory")?;
    let mut table = TextureTable::new();
    let mut uploads = UploadLog::new();

    for spec in trace.textures {
        if table.get(spec.id).is_some() {
            bail!("duplicate texture id {}", spec.id);
        }
        let layout = TextureLayout::new(
            spec.layout.width,
            spec.layout.height,
            spec.layout.levels,
            spec.layout.bytes_per_texel,
        )
        .with_category(spec.layout.category);
        layout
            .validate()
            .with_context(|| format!("texture {} has an invalid layout", spec.id))?;
        let residency = TextureResidency::new(layout).with_priority(spec.priority);
        table.insert(spec.id, residency);
        table.set_bound(spec.id, spec.bound);
    }

    let mut outcomes = Vec::with_capacity(trace.ops.len());
    for (index, op) in trace.ops.into_iter().enumerate() {
        let result = apply(&mut manager, &mut table, &mut uploads, &op);
        match result {
            Ok(()) => outcomes.push(OpOutcome {
                index,
                op,
                ok: true,
                error: None,
            }),
            Err(err) if err.is_recoverable() => {
                log::info!("operation {index} failed: {err}");
                outcomes.push(OpOutcome {
                    index,
                    op,
                    ok: false,
                    error: Some(err.to_string()),
                });
            }
            Err(err) => {
                return Err(err).with_context(|| format!("operation {index} failed fatally"));
            }
        }
    }

    let textures = table
        .texture_ids()
        .into_iter()
        .filter_map(|id| {
            let record = table.residency(id)?;
            Some(TextureReport {
                id,
                placement: record.placement(),
                priority: record.priority(),
                last_used_stamp: record.last_used_stamp(),
                pin_until_frame: record.pin_until_frame(),
                pool_affinity: record.pool_affinity(),
                dirty: record.dirty(),
            })
        })
        .collect();

    let units = manager
        .usage()
        .into_iter()
        .map(|usage| UnitReport {
            utilization: usage.utilization(),
            fragmentation: usage.fragmentation(),
            ranges: manager.free_ranges(usage.unit),
            usage,
        })
        .collect();

    Ok(Report {
        outcomes,
        uploads: uploads.take(),
        textures,
        units,
        stats: manager.stats().clone(),
    })
}

fn apply(
    manager: &mut TextureMemoryManager,
    table: &mut TextureTable,
    uploads: &mut UploadLog,
    op: &Op,
) -> texmem::Result<()> {
    match *op {
        Op::Request { texture, hint } => {
            manager.request_residency(table, uploads, texture, hint)
        }
        Op::Release { texture } => manager.release_residency(table, texture),
        Op::Free { texture } => manager.free_texture(table, texture),
        Op::Dirty {
            texture,
            level,
            row_start,
            row_count,
        } => {
            manager.mark_dirty(table, uploads, texture, level, row_start, row_count)
        }
        Op::Reload { texture, level } => {
            manager.reload_level(table, uploads, texture, level)
        }
        Op::Flush => {
            manager.flush_all(table, uploads);
            Ok(())
        }
        Op::Frame => {
            manager.begin_frame();
            Ok(())
        }
        Op::Bind { texture } => {
            known(table, texture)?;
            table.set_bound(texture, true);
            manager.advance_bind_counter();
            manager.touch(table, texture);
            Ok(())
        }
        Op::Unbind { texture } => {
            known(table, texture)?;
            table.set_bound(texture, false);
            Ok(())
        }
        Op::Priority { texture, priority } => {
            let entry = table
                .get_mut(texture)
                .ok_or(TexMemError::UnknownTexture(texture))?;
            entry.residency.set_priority(priority);
            Ok(())
        }
        Op::Restore => manager.restore_all_bound(table, uploads).map(|_| ()),
    }
}

fn known(table: &TextureTable, texture: TextureId) -> texmem::Result<()> {
    match table.get(texture) {
        Some(_) => Ok(()),
        None => Err(TexMemError::UnknownTexture(texture)),
    }
}
