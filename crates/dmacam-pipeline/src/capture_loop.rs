//! One iteration per rendered frame:
//!
//! ```text
//!  implicit:  reclaim ─► rebind ─► release ─► render
//!  fence:     [resubmit retired buffers whose fence signalled]
//!             reclaim ─► rebind ─► retire previous ─► render ─► fence
//! ```
//!
//! Reclaim never blocks. With nothing ready the previous texture is drawn
//! again.
//!
//! In fence mode the buffer on screen stays with the consumer until a newer
//! frame has been bound in its place. It then waits in the retiring list until
//! the fence of its last draw signals, and only then goes back to the driver.
//! A draw is only issued while the consumer holds the bound buffer, so nothing
//! is drawn before the first capture.

use dmacam_capture::VideoDevice;
use dmacam_core::errors::StreamError;
use dmacam_core::{BufferIndex, DmacamError, SyncPolicy};
use dmacam_renderer::{FrameRenderer, ImageImporter};
use tracing::{info, trace};

use crate::session::Session;

const STATS_INTERVAL: u64 = 300;

/// What one iteration drew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A newly captured buffer was bound and drawn.
    Captured { index: BufferIndex, sequence: u32 },
    /// Nothing new was reclaimed; the previous texture was drawn again.
    Reused,
    /// Fence mode only: the consumer holds no buffer, so nothing was drawn.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub captured: u64,
    pub reused: u64,
    pub skipped: u64,
    pub draws: u64,
    pub corrupt: u64,
}

impl std::fmt::Display for LoopStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} iterations, {} captured, {} reused, {} skipped, {} draws, {} corrupt",
            self.iterations, self.captured, self.reused, self.skipped, self.draws, self.corrupt
        )
    }
}

pub struct CaptureLoop<F> {
    sync: SyncPolicy,
    /// Fence mode: the buffer behind the texture, with the fence of its
    /// latest draw.
    shown: Option<(BufferIndex, Option<F>)>,
    /// Fence mode: superseded buffers waiting for their last draw to finish.
    retiring: Vec<(BufferIndex, F)>,
    stats: LoopStats,
}

impl<F> CaptureLoop<F> {
    pub fn new(sync: SyncPolicy) -> Self {
        Self { sync, shown: None, retiring: Vec::new(), stats: LoopStats::default() }
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync
    }

    /// Buffer the texture shows while the consumer still owns it.
    pub fn held_buffer(&self) -> Option<BufferIndex> {
        self.shown.as_ref().map(|(index, _)| *index)
    }

    /// Buffers kept out of the fill queue until their fence signals.
    pub fn retiring_buffers(&self) -> impl Iterator<Item = BufferIndex> + '_ {
        self.retiring.iter().map(|(index, _)| *index)
    }

    /// Run one iteration. Any error is fatal for the run: the device state is
    /// unknown afterwards.
    pub fn step<D, I, R>(
        &mut self,
        session: &mut Session<D, I>,
        renderer: &mut R,
    ) -> Result<FrameOutcome, DmacamError>
    where
        D: VideoDevice,
        I: ImageImporter,
        R: FrameRenderer<Fence = F>,
    {
        self.stats.iterations += 1;

        let outcome = match self.sync {
            SyncPolicy::Implicit => self.step_implicit(session, renderer)?,
            SyncPolicy::Fence => self.step_fenced(session, renderer)?,
        };
        match outcome {
            FrameOutcome::Captured { .. } => self.stats.captured += 1,
            FrameOutcome::Reused => self.stats.reused += 1,
            FrameOutcome::Skipped => self.stats.skipped += 1,
        }

        if self.stats.iterations % STATS_INTERVAL == 0 {
            info!("Capture loop: {}", self.stats);
        }
        Ok(outcome)
    }

    fn step_implicit<D, I, R>(
        &mut self,
        session: &mut Session<D, I>,
        renderer: &mut R,
    ) -> Result<FrameOutcome, DmacamError>
    where
        D: VideoDevice,
        I: ImageImporter,
        R: FrameRenderer<Fence = F>,
    {
        let outcome = match session.reclaim()? {
            Some(done) => {
                session.refresh_binding(done.index)?;
                session.release(done.index)?;
                if done.is_corrupt() {
                    self.stats.corrupt += 1;
                }
                FrameOutcome::Captured { index: done.index, sequence: done.sequence }
            }
            None => FrameOutcome::Reused,
        };

        let texture = *session.texture().ok_or(StreamError::NotStreaming)?;
        renderer.draw(&texture)?;
        self.stats.draws += 1;
        Ok(outcome)
    }

    fn step_fenced<D, I, R>(
        &mut self,
        session: &mut Session<D, I>,
        renderer: &mut R,
    ) -> Result<FrameOutcome, DmacamError>
    where
        D: VideoDevice,
        I: ImageImporter,
        R: FrameRenderer<Fence = F>,
    {
        self.resubmit_finished(session, renderer)?;

        let outcome = match session.reclaim()? {
            Some(done) => {
                session.refresh_binding(done.index)?;
                if let Some((previous, fence)) = self.shown.replace((done.index, None)) {
                    self.retire(previous, fence, session)?;
                }
                if done.is_corrupt() {
                    self.stats.corrupt += 1;
                }
                FrameOutcome::Captured { index: done.index, sequence: done.sequence }
            }
            None if self.shown.is_some() => FrameOutcome::Reused,
            None => FrameOutcome::Skipped,
        };

        if let Some((index, last_fence)) = self.shown.as_mut() {
            let texture = *session.texture().ok_or(StreamError::NotStreaming)?;
            debug_assert_eq!(texture.buffer, *index);
            renderer.draw(&texture)?;
            self.stats.draws += 1;
            let fence = renderer.insert_fence()?;
            // Fences complete in order; the newest one covers every earlier draw.
            if let Some(older) = last_fence.replace(fence) {
                renderer.release_fence(older);
            }
        }

        // With every buffer on the consumer side the driver can never deliver
        // a replacement, so the shown buffer has to go back once drawn.
        if self.retiring.is_empty() && session.stream().queued_count() == 0 {
            if let Some((index, fence)) = self.shown.take() {
                trace!("No buffer left with the driver; retiring shown buffer {}", index);
                self.retire(index, fence, session)?;
            }
        }
        Ok(outcome)
    }

    fn resubmit_finished<D, I, R>(
        &mut self,
        session: &mut Session<D, I>,
        renderer: &mut R,
    ) -> Result<(), DmacamError>
    where
        D: VideoDevice,
        I: ImageImporter,
        R: FrameRenderer<Fence = F>,
    {
        let mut i = 0;
        while i < self.retiring.len() {
            if renderer.fence_signaled(&self.retiring[i].1) {
                let (index, fence) = self.retiring.remove(i);
                renderer.release_fence(fence);
                session.release(index)?;
                trace!("Fence for buffer {} signalled; resubmitted", index);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn retire<D, I>(
        &mut self,
        index: BufferIndex,
        fence: Option<F>,
        session: &mut Session<D, I>,
    ) -> Result<(), DmacamError>
    where
        D: VideoDevice,
        I: ImageImporter,
    {
        match fence {
            Some(fence) => self.retiring.push((index, fence)),
            // Never drawn, so no GPU work can still read it.
            None => session.release(index)?,
        }
        Ok(())
    }

    /// Drop every outstanding fence. Buffers still held go back to the driver
    /// when streaming stops.
    pub fn finish<R: FrameRenderer<Fence = F>>(&mut self, renderer: &mut R) {
        if let Some((index, Some(fence))) = self.shown.take() {
            trace!("Dropping fence for shown buffer {}", index);
            renderer.release_fence(fence);
        }
        for (index, fence) in self.retiring.drain(..) {
            trace!("Dropping fence for retiring buffer {}", index);
            renderer.release_fence(fence);
        }
        info!("Capture loop finished: {}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmacam_capture::mock::{Call, ScriptedDevice};
    use dmacam_capture::{CaptureStream, DeviceHandle};
    use dmacam_core::{BufferState, CaptureConfig, RefreshPolicy};
    use dmacam_renderer::mock::{GpuCall, MockFence, RecordingGpu};

    fn session(dev: ScriptedDevice, buffers: u32, gpu: RecordingGpu) -> Session<ScriptedDevice, RecordingGpu> {
        let config = CaptureConfig { buffer_count: buffers, ..CaptureConfig::default() };
        let stream = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config).unwrap();
        Session::start(stream, gpu, RefreshPolicy::Rebind).unwrap()
    }

    #[test]
    fn implicit_order_is_rebind_then_release_then_draw() {
        let dev = ScriptedDevice::streaming();
        let script = dev.script();
        let mut gpu = RecordingGpu::new();
        let log = gpu.log();
        let mut s = session(dev, 1, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Implicit);

        let before = script.lock().unwrap().calls.len();
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(0), .. }));

        let calls = script.lock().unwrap().calls[before..].to_vec();
        assert_eq!(calls, vec![Call::Dequeue(Some(0)), Call::Queue(0)]);
        let gpu_calls = log.lock().unwrap().calls.clone();
        let n = gpu_calls.len();
        assert!(matches!(gpu_calls[n - 2], GpuCall::Bind { buffer: BufferIndex(0), .. }));
        assert_eq!(gpu_calls[n - 1], GpuCall::Draw { buffer: BufferIndex(0) });
    }

    #[test]
    fn nothing_ready_redraws_previous_texture() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        let mut gpu = RecordingGpu::new();
        let log = gpu.log();
        let mut s = session(dev, 2, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Implicit);

        script.lock().unwrap().ready_frames = 1;
        assert!(matches!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Captured { .. }));
        assert_eq!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Reused);
        assert_eq!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Reused);

        assert_eq!(log.lock().unwrap().draws(), vec![BufferIndex(0); 3]);
        assert_eq!(lp.stats().reused, 2);
        assert_eq!(lp.stats().draws, 3);
    }

    #[test]
    fn fence_keeps_shown_buffer_until_replaced_and_signalled() {
        let dev = ScriptedDevice::streaming();
        let script = dev.script();
        let mut gpu = RecordingGpu::new();
        let log = gpu.log();
        log.lock().unwrap().fence_latency = 1;
        let mut s = session(dev, 2, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Fence);

        // #0 captured and drawn; #1 is still with the driver.
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(0), .. }));
        assert_eq!(lp.held_buffer(), Some(BufferIndex(0)));

        // #1 replaces #0 on screen; #0 waits for its fence.
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(1), .. }));
        assert_eq!(lp.retiring_buffers().collect::<Vec<_>>(), vec![BufferIndex(0)]);
        assert_eq!(s.stream().state(BufferIndex(0)), Some(BufferState::Dequeued));

        // Fence still pending, driver empty: #1 is drawn again, #0 stays out.
        assert_eq!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Reused);
        assert_eq!(s.stream().state(BufferIndex(0)), Some(BufferState::Dequeued));
        assert_eq!(s.stream().state(BufferIndex(1)), Some(BufferState::Dequeued));

        // Fence signalled: #0 resubmitted, refilled and shown; #1 retires.
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(0), .. }));
        assert_eq!(lp.retiring_buffers().collect::<Vec<_>>(), vec![BufferIndex(1)]);

        let calls = script.lock().unwrap().calls.clone();
        let requeue = calls.iter().rposition(|c| *c == Call::Queue(0)).unwrap();
        let redequeue = calls.iter().rposition(|c| *c == Call::Dequeue(Some(0))).unwrap();
        assert!(requeue < redequeue);
        assert_eq!(
            log.lock().unwrap().draws(),
            vec![BufferIndex(0), BufferIndex(1), BufferIndex(1), BufferIndex(0)]
        );

        lp.finish(&mut gpu);
        assert!(lp.held_buffer().is_none());
        assert_eq!(lp.retiring_buffers().count(), 0);
    }

    #[test]
    fn fence_mode_only_draws_buffers_the_consumer_holds() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        let mut gpu = RecordingGpu::new();
        let log = gpu.log();
        let mut s = session(dev, 2, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Fence);

        // Slot 0 is bound but owned by the driver until the first capture.
        assert_eq!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Skipped);
        assert!(log.lock().unwrap().draws().is_empty());

        script.lock().unwrap().ready_frames = 1;
        for _ in 0..4 {
            lp.step(&mut s, &mut gpu).unwrap();
            let drawn = log.lock().unwrap().draws().last().copied().expect("a draw");
            assert_eq!(s.stream().state(drawn), Some(BufferState::Dequeued));
        }
        assert_eq!(lp.stats().skipped, 1);
        assert_eq!(lp.stats().reused, 3);
        assert_eq!(lp.stats().draws, 4);
    }

    #[test]
    fn single_buffer_fence_mode_skips_while_buffer_is_with_driver() {
        let dev = ScriptedDevice::streaming();
        let mut gpu = RecordingGpu::new();
        let log = gpu.log();
        log.lock().unwrap().fence_latency = 1;
        let mut s = session(dev, 1, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Fence);

        // Drawn, then retired at once: the driver has nothing else to fill.
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(0), .. }));
        assert_eq!(lp.held_buffer(), None);
        assert_eq!(s.stream().state(BufferIndex(0)), Some(BufferState::Dequeued));

        // Fence pending: nothing to show.
        assert_eq!(lp.step(&mut s, &mut gpu).unwrap(), FrameOutcome::Skipped);

        // Fence signalled: resubmitted and captured again.
        let outcome = lp.step(&mut s, &mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Captured { index: BufferIndex(0), .. }));
        assert_eq!(log.lock().unwrap().draws(), vec![BufferIndex(0); 2]);
    }

    #[test]
    fn dequeue_failure_is_fatal() {
        let dev = ScriptedDevice::streaming();
        let script = dev.script();
        let mut gpu = RecordingGpu::new();
        let mut s = session(dev, 1, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Implicit);

        script.lock().unwrap().dequeue_errno = Some(libc::EIO);
        let err = lp.step(&mut s, &mut gpu).unwrap_err();
        assert!(matches!(err, DmacamError::Stream(StreamError::Dequeue { .. })));
    }

    #[test]
    fn corrupt_frames_are_counted_and_cycled() {
        let dev = ScriptedDevice::streaming();
        dev.script().lock().unwrap().corrupt_frames = 2;
        let mut gpu = RecordingGpu::new();
        let mut s = session(dev, 1, gpu.clone());
        let mut lp: CaptureLoop<MockFence> = CaptureLoop::new(SyncPolicy::Implicit);

        for _ in 0..4 {
            lp.step(&mut s, &mut gpu).unwrap();
        }
        assert_eq!(lp.stats().captured, 4);
        assert_eq!(lp.stats().corrupt, 2);
    }
}
