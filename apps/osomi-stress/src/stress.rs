//! The stress loop.

use anyhow::{ensure, Context};
use ash::vk;
use osomi_core::Bitset;
use osomi_gpu::{
    BufferUsage, DestroyOutcome, GpuBufferInfo, GpuError, Graphics, GraphicsConfig, HostBackend,
    ObjectId, SamplerInfo, TextureInfo, TextureUsage,
};
use tracing::{debug, info, warn};

/// Run parameters (from CLI or defaults).
#[derive(Debug, Clone)]
pub struct StressParams {
    pub objects: usize,
    pub rounds: usize,
    pub max_id: u32,
    pub seed: u64,
}

impl Default for StressParams {
    fn default() -> Self {
        Self {
            objects: 256,
            rounds: 16,
            max_id: 0xFFFF,
            seed: 42,
        }
    }
}

impl StressParams {
    /// Parse parameters from command line arguments.
    pub fn from_args() -> Self {
        let mut params = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            let consumed = match args[i].as_str() {
                "--objects" => parse_into(value, &mut params.objects),
                "--rounds" => parse_into(value, &mut params.rounds),
                "--max-id" => parse_into(value, &mut params.max_id),
                "--seed" => parse_into(value, &mut params.seed),
                other => {
                    warn!("ignoring unknown argument {other}");
                    false
                }
            };
            i += if consumed { 2 } else { 1 };
        }

        params
    }
}

fn parse_into<T: std::str::FromStr>(value: Option<&String>, target: &mut T) -> bool {
    match value.and_then(|v| v.parse().ok()) {
        Some(v) => {
            *target = v;
            true
        }
        None => false,
    }
}

/// Totals over a run.
#[derive(Debug, Default)]
pub struct StressReport {
    pub created: usize,
    pub freed: usize,
    pub shared: usize,
    pub failed: usize,
    pub peak_objects: usize,
    pub peak_reserved: u64,
}

/// Small xorshift generator for a reproducible operation mix.
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

pub struct StressRun {
    params: StressParams,
    graphics: Graphics<HostBackend>,
    /// Live objects and the number of holders this run owns on each.
    live: Vec<(ObjectId, u32)>,
    rng: Rng,
    report: StressReport,
}

impl StressRun {
    /// Set up a registry on a host backend.
    pub fn new(params: StressParams) -> anyhow::Result<Self> {
        let config = GraphicsConfig::default()
            .with_max_id(params.max_id)
            .with_heap_size(1 << 20)
            .with_default_block_size(4 << 20);
        let graphics = Graphics::new(config, HostBackend::default())
            .context("Failed to create graphics registry")?;

        Ok(Self {
            rng: Rng(params.seed.max(1)),
            params,
            graphics,
            live: Vec::new(),
            report: StressReport::default(),
        })
    }

    /// Run every round, then shut down and check nothing leaked.
    pub fn run(mut self) -> anyhow::Result<StressReport> {
        for round in 0..self.params.rounds {
            self.graphics.begin()?;
            self.create_batch(round);
            self.share_some();
            self.destroy_some();
            self.graphics.end()?;

            self.check_bookkeeping()?;
            self.report.peak_objects = self.report.peak_objects.max(self.graphics.object_count());
            self.report.peak_reserved = self
                .report
                .peak_reserved
                .max(self.graphics.memory().reserved_bytes());

            info!(
                round,
                objects = self.graphics.object_count(),
                blocks = self.graphics.memory().block_count(),
                allocated = self.graphics.memory().allocated_bytes(),
                reserved = self.graphics.memory().reserved_bytes(),
                "round complete"
            );
        }

        self.graphics.log_objects();
        self.graphics.shutdown();
        ensure!(
            self.graphics.backend().is_clean(),
            "backend still holds native objects after shutdown"
        );

        Ok(self.report)
    }

    fn create_batch(&mut self, round: usize) {
        for i in 0..self.params.objects {
            let name = format!("r{round}-{i}");
            let created = match self.rng.below(8) {
                0..=3 => {
                    let size = 64 << self.rng.below(8);
                    let usage = if self.rng.below(2) == 0 {
                        BufferUsage::STORAGE
                    } else {
                        BufferUsage::UNIFORM | BufferUsage::VERTEX
                    };
                    let host_visible = self.rng.below(3) == 0;
                    let info = GpuBufferInfo::new(size, usage).host_visible(host_visible);
                    self.graphics.create(name, info).map(|h| h.id())
                }
                4..=6 => {
                    let side = 16 << self.rng.below(5);
                    let format = vk::Format::R8G8B8A8_UNORM;
                    let info = TextureInfo::new(side, side, format, TextureUsage::Image);
                    self.graphics.create(name, info).map(|h| h.id())
                }
                _ => self.graphics.create(name, SamplerInfo::default()).map(|h| h.id()),
            };

            match created {
                Ok(id) => {
                    self.graphics.use_object(id);
                    self.live.push((id, 1));
                    self.report.created += 1;
                }
                Err(GpuError::IdSpaceExhausted { max_id }) => {
                    debug!(max_id, "id space full, ending batch early");
                    self.report.failed += 1;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "create failed");
                    self.report.failed += 1;
                }
            }
        }
    }

    fn share_some(&mut self) {
        if self.live.is_empty() {
            return;
        }
        for _ in 0..self.live.len() / 8 {
            let index = self.rng.below(self.live.len());
            let (id, holders) = &mut self.live[index];
            if self.graphics.retain_id(*id) {
                *holders += 1;
                self.report.shared += 1;
            }
        }
    }

    fn destroy_some(&mut self) {
        let count = self.live.len() / 2;
        for _ in 0..count {
            let index = self.rng.below(self.live.len());
            let (id, holders) = &mut self.live[index];

            match self.graphics.destroy_id(*id) {
                DestroyOutcome::Freed => {
                    self.live.swap_remove(index);
                    self.report.freed += 1;
                }
                DestroyOutcome::StillReferenced => *holders -= 1,
                DestroyOutcome::NotFound => {
                    warn!(%id, "tracked object vanished");
                    self.live.swap_remove(index);
                }
            }
        }
    }

    /// The id bitmap must hold exactly the ids this run still tracks.
    fn check_bookkeeping(&self) -> anyhow::Result<()> {
        let mut expected = Bitset::new(self.params.max_id as usize + 1);
        expected.set(0, true);
        for (id, _) in &self.live {
            expected.set(id.raw() as usize, true);
        }

        ensure!(
            &expected == self.graphics.id_bitmap(),
            "id bitmap disagrees with live objects"
        );
        ensure!(
            self.graphics.object_count() == self.live.len(),
            "registry holds {} objects, expected {}",
            self.graphics.object_count(),
            self.live.len()
        );
        for (id, holders) in &self.live {
            let object = self
                .graphics
                .object(*id)
                .with_context(|| format!("object {id} is missing"))?;
            ensure!(
                object.ref_count() == *holders as i32,
                "object {id} has {} holders, expected {holders}",
                object.ref_count()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_run_stays_consistent() {
        let params = StressParams {
            objects: 32,
            rounds: 6,
            max_id: 512,
            seed: 7,
        };
        let report = StressRun::new(params).unwrap().run().unwrap();
        assert!(report.created > 0);
        assert!(report.freed > 0);
        assert!(report.peak_objects <= 512);
    }

    #[test]
    fn tiny_id_space_fills_up() {
        let params = StressParams {
            objects: 64,
            rounds: 3,
            max_id: 16,
            seed: 3,
        };
        let report = StressRun::new(params).unwrap().run().unwrap();
        assert!(report.failed > 0);
        assert!(report.peak_objects <= 16);
    }
}
