use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::error::ColorimeterError;
use crate::series::{Channel, Series};
use crate::store::SampleStore;

/// Shortening the settle delay below this causes cross-channel bleed in the
/// photodetector readings. Hardware constraint, do not lower.
pub const MIN_SETTLE_DELAY_S: f64 = 0.05;

const PAUSE_BEEP_DUTY: f64 = 0.01;
const PAUSE_BEEP_ON: Duration = Duration::from_millis(10);

const END_PULSES: usize = 3;
const END_PULSE_DUTY: f64 = 0.2;
const END_PULSE_ON: Duration = Duration::from_millis(80);
const END_PULSE_GAP: Duration = Duration::from_millis(400);

/// Run parameters. The defaults are the values the instrument was
/// characterized with; a JSON file with any subset of the fields overrides
/// them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of measurement cycles.
    pub cycles: usize,
    /// Wait between electrical state changes, seconds. Floor-enforced at
    /// [`MIN_SETTLE_DELAY_S`].
    pub settle_delay_s: f64,
    /// Wait between cycles, seconds.
    pub cycle_delay_s: f64,
    /// Thermistor reads averaged into one temperature value per cycle.
    pub temp_reads: usize,
    /// Gap between consecutive thermistor reads, seconds.
    pub temp_read_gap_s: f64,
    /// Multiplier on the normalized photodetector reading. Historical runs
    /// were recorded with both 1.0 and 10.0; pick one and keep it for the
    /// whole experiment so runs stay comparable.
    pub photo_scale: f64,
    /// Multiplier on the averaged thermistor reading.
    pub temp_scale: f64,
    /// Normalized pause-sensor level above which the run holds.
    pub pause_threshold: f64,
    /// Polling interval inside the pause hold, seconds.
    pub pause_poll_s: f64,
    /// Abort the run if a single pause lasts longer than this, seconds.
    /// `None` holds forever, like the instrument always has.
    pub pause_timeout_s: Option<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cycles: 25,
            settle_delay_s: 0.05,
            cycle_delay_s: 0.01,
            temp_reads: 10,
            temp_read_gap_s: 0.001,
            photo_scale: 1.0,
            temp_scale: 500.0,
            pause_threshold: 0.8,
            pause_poll_s: 0.05,
            pause_timeout_s: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ColorimeterError> {
        if self.cycles == 0 {
            return Err(ColorimeterError::InvalidParameter(
                "run length must be at least one cycle".to_string(),
            ));
        }
        if self.settle_delay_s < MIN_SETTLE_DELAY_S {
            return Err(ColorimeterError::InvalidParameter(format!(
                "settle delay {} s is below the {MIN_SETTLE_DELAY_S} s minimum",
                self.settle_delay_s
            )));
        }
        if self.cycle_delay_s < 0.0 || self.temp_read_gap_s < 0.0 {
            return Err(ColorimeterError::InvalidParameter(
                "delays must not be negative".to_string(),
            ));
        }
        if self.temp_reads == 0 {
            return Err(ColorimeterError::InvalidParameter(
                "at least one thermistor read per cycle is required".to_string(),
            ));
        }
        if !(self.pause_threshold > 0.0 && self.pause_threshold <= 1.0) {
            return Err(ColorimeterError::InvalidParameter(format!(
                "pause threshold {} must be within (0, 1]",
                self.pause_threshold
            )));
        }
        if self.pause_poll_s <= 0.0 {
            return Err(ColorimeterError::InvalidParameter(
                "pause polling interval must be positive".to_string(),
            ));
        }
        if let Some(timeout) = self.pause_timeout_s {
            if timeout <= 0.0 {
                return Err(ColorimeterError::InvalidParameter(
                    "pause timeout must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_s)
    }

    fn cycle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_delay_s)
    }

    fn temp_read_gap(&self) -> Duration {
        Duration::from_secs_f64(self.temp_read_gap_s)
    }

    fn pause_poll(&self) -> Duration {
        Duration::from_secs_f64(self.pause_poll_s)
    }
}

/// Drives one measurement run: the fixed per-cycle schedule, the pause hold,
/// per-cycle checkpoints to the store, and the end-of-run buzzer pattern.
///
/// The loop owns the board for the run's duration and releases it on every
/// exit path, error paths included, so no LED is left energized.
pub struct AcquisitionLoop<B: Board> {
    board: B,
    config: RunConfig,
    store: SampleStore,
    run_name: String,
}

impl<B: Board> AcquisitionLoop<B> {
    pub fn new(
        board: B,
        config: RunConfig,
        store: SampleStore,
        run_name: &str,
    ) -> Result<Self, ColorimeterError> {
        config.validate()?;
        SampleStore::validate_name(run_name)?;
        Ok(Self {
            board,
            config,
            store,
            run_name: run_name.to_string(),
        })
    }

    pub fn run(self) -> Result<Series, ColorimeterError> {
        let never = AtomicBool::new(false);
        self.run_with_stop(&never)
    }

    /// Like [`run`](Self::run), but checks `stop` once per cycle; a stopped
    /// run ends orderly with the cycles completed so far.
    pub fn run_with_stop(mut self, stop: &AtomicBool) -> Result<Series, ColorimeterError> {
        let outcome = self.acquire(stop);
        let released = self.board.close();
        let series = outcome?;
        released?;
        Ok(series)
    }

    fn acquire(&mut self, stop: &AtomicBool) -> Result<Series, ColorimeterError> {
        let cfg = self.config;
        let mut series = Series::with_capacity(cfg.cycles);

        // all outputs known-low before the first cycle
        for channel in Channel::ALL {
            self.board.set_led(channel, false)?;
        }
        self.board.set_buzzer(0.0)?;

        let started = Instant::now();
        let mut completed = 0usize;
        for cycle in 0..cfg.cycles {
            if stop.load(Ordering::Relaxed) {
                log::info!("stop requested, ending run after {completed} cycles");
                break;
            }
            self.wait_while_paused()?;
            log::info!("cycle {}/{}", cycle + 1, cfg.cycles);

            thread::sleep(cfg.settle_delay());
            let temperature = self.average_temperature()?;
            series.set_temperature(cycle, temperature);

            for channel in Channel::ALL {
                thread::sleep(cfg.settle_delay());
                self.board.set_led(channel, true)?;
                thread::sleep(cfg.settle_delay());
                let signal = cfg.photo_scale * self.board.read_photodetector()?;
                series.set_signal(cycle, channel, signal);
                series.set_elapsed(cycle, channel, started.elapsed().as_secs_f64());
                thread::sleep(cfg.settle_delay());
                self.board.set_led(channel, false)?;
            }

            completed = cycle + 1;
            self.store
                .save(&series.truncated(completed), &self.run_name)?;
            thread::sleep(cfg.cycle_delay());
        }

        self.end_signal()?;
        Ok(series.truncated(completed))
    }

    /// Voltages need the surrounding settle time to stabilize between the
    /// light and temperature measurements; averaging a burst of reads then
    /// gives a usable temperature value.
    fn average_temperature(&mut self) -> Result<f64, ColorimeterError> {
        let cfg = self.config;
        let mut sum = 0.0;
        for _ in 0..cfg.temp_reads {
            sum += self.board.read_thermistor()?;
            thread::sleep(cfg.temp_read_gap());
        }
        Ok(cfg.temp_scale * sum / cfg.temp_reads as f64)
    }

    fn wait_while_paused(&mut self) -> Result<(), ColorimeterError> {
        let cfg = self.config;
        if self.board.read_pause_sensor()? <= cfg.pause_threshold {
            return Ok(());
        }
        log::warn!("pause sensor high, holding acquisition");
        let paused_at = Instant::now();
        loop {
            if let Some(limit) = cfg.pause_timeout_s {
                let held = paused_at.elapsed().as_secs_f64();
                if held > limit {
                    return Err(ColorimeterError::PauseTimeout(held));
                }
            }
            thread::sleep(cfg.pause_poll());
            self.board.set_buzzer(PAUSE_BEEP_DUTY)?;
            thread::sleep(PAUSE_BEEP_ON);
            self.board.set_buzzer(0.0)?;
            if self.board.read_pause_sensor()? < cfg.pause_threshold {
                thread::sleep(cfg.pause_poll());
                log::info!("pause sensor released, resuming");
                return Ok(());
            }
        }
    }

    fn end_signal(&mut self) -> Result<(), ColorimeterError> {
        for _ in 0..END_PULSES {
            self.board.set_buzzer(END_PULSE_DUTY)?;
            thread::sleep(END_PULSE_ON);
            self.board.set_buzzer(0.0)?;
            thread::sleep(END_PULSE_GAP);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SimulatedBoard;

    fn fast_config(cycles: usize) -> RunConfig {
        RunConfig {
            cycles,
            ..RunConfig::default()
        }
    }

    fn end_pulses(board: &SimulatedBoard) -> usize {
        board
            .buzzer_writes()
            .iter()
            .filter(|&&duty| (duty - END_PULSE_DUTY).abs() < 1e-9)
            .count()
    }

    #[test]
    fn deterministic_run_produces_expected_series() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let mut board = SimulatedBoard::default()
            .with_photo_levels([0.62, 0.54, 0.47])
            .with_thermistor_level(0.044);

        let series = AcquisitionLoop::new(&mut board, fast_config(3), store.clone(), "deterministic")
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(series.as_array().dim(), (3, 3, 3));
        for cycle in 0..3 {
            assert!((series.signal(Channel::Blue)[cycle] - 0.62).abs() < 1e-12);
            assert!((series.signal(Channel::Green)[cycle] - 0.54).abs() < 1e-12);
            assert!((series.signal(Channel::Red)[cycle] - 0.47).abs() < 1e-12);
            assert!((series.temperature()[cycle] - 22.0).abs() < 1e-9);
        }
        // elapsed times move forward within each channel
        for channel in Channel::ALL {
            let elapsed = series.elapsed(channel);
            for cycle in 1..elapsed.len() {
                assert!(elapsed[cycle] >= elapsed[cycle - 1]);
            }
        }
        assert_eq!(end_pulses(&board), 3);
        assert!(board.is_closed());
        // the final checkpoint matches the returned series
        assert_eq!(store.load("deterministic").unwrap(), series);
    }

    #[test]
    fn single_cycle_run_works() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let mut board = SimulatedBoard::default();
        let series = AcquisitionLoop::new(&mut board, fast_config(1), store, "single")
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn checkpoint_survives_board_fault() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        // two full cycles (6 LED activations), then the board dies in cycle 3
        let mut board = SimulatedBoard::default().failing_after_led_activations(6);

        let result = AcquisitionLoop::new(&mut board, fast_config(5), store.clone(), "faulted")
            .unwrap()
            .run();
        assert!(matches!(result, Err(ColorimeterError::HardwareIo(_))));
        // the board is still released on the failure path
        assert!(board.is_closed());

        let recovered = store.load("faulted").unwrap();
        assert_eq!(recovered.len(), 2);
        // no end-of-run pattern after an abort
        assert_eq!(end_pulses(&board), 0);
    }

    #[test]
    fn pause_holds_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        // paused at the first cycle's check, released on the re-check
        let mut board = SimulatedBoard::default().with_pause_script([0.9, 0.5]);
        let series = AcquisitionLoop::new(&mut board, fast_config(2), store, "paused")
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(series.len(), 2);
        // the hold chirps the buzzer at its own low duty
        assert!(board
            .buzzer_writes()
            .iter()
            .any(|&duty| (duty - PAUSE_BEEP_DUTY).abs() < 1e-9));
    }

    #[test]
    fn pause_timeout_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let mut board = SimulatedBoard::default().with_pause_script(
            std::iter::repeat(0.95).take(64).collect::<Vec<_>>(),
        );
        let config = RunConfig {
            pause_timeout_s: Some(0.2),
            ..fast_config(2)
        };
        let result = AcquisitionLoop::new(&mut board, config, store, "held")
            .unwrap()
            .run();
        assert!(matches!(result, Err(ColorimeterError::PauseTimeout(_))));
        assert!(board.is_closed());
    }

    #[test]
    fn stop_flag_ends_run_early() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let mut board = SimulatedBoard::default();
        let stop = AtomicBool::new(true);
        let series = AcquisitionLoop::new(&mut board, fast_config(10), store.clone(), "stopped")
            .unwrap()
            .run_with_stop(&stop)
            .unwrap();
        assert!(series.is_empty());
        // nothing completed, nothing checkpointed
        assert!(matches!(
            store.load("stopped"),
            Err(ColorimeterError::ArchiveNotFound(_))
        ));
        // the run still ends orderly
        assert_eq!(end_pulses(&board), 3);
        assert!(board.is_closed());
    }

    #[test]
    fn settle_delay_floor_is_enforced() {
        let config = RunConfig {
            settle_delay_s: 0.01,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ColorimeterError::InvalidParameter(_))
        ));
    }

    #[test]
    fn zero_cycles_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let board = SimulatedBoard::default();
        assert!(matches!(
            AcquisitionLoop::new(board, fast_config(0), store, "empty"),
            Err(ColorimeterError::InvalidParameter(_))
        ));
    }
}
