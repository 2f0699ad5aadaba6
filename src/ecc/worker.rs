//! The worker pool, and the per-page processing each worker does.

use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, info};

use super::layout::SectionLayout;
use super::queue::{Work, WorkQueue};
use super::{Codeword, CodewordHandler, Disposition, EccError};

/// The input bytes of a run, and where corrected bytes go (if anywhere).
///
/// In "in place" mode `input` and `output` point at the same memory. Workers only ever touch the
/// page they were handed, and pages don't overlap, so no two threads access the same bytes.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Image<'a> {
    input: NonNull<u8>,
    output: Option<NonNull<u8>>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for Image<'_> {}
unsafe impl Sync for Image<'_> {}

impl<'a> Image<'a> {
    pub fn read_only(input: &'a [u8]) -> Self {
        Self {
            input: NonNull::from(input).cast(),
            output: None,
            len: input.len(),
            _marker: PhantomData,
        }
    }

    /// `input` and `output` must be equally long
    pub fn copy(input: &'a [u8], output: &'a mut [u8]) -> Self {
        debug_assert_eq!(input.len(), output.len());
        Self {
            input: NonNull::from(input).cast(),
            output: Some(NonNull::from(output).cast()),
            len: input.len(),
            _marker: PhantomData,
        }
    }

    pub fn in_place(image: &'a mut [u8]) -> Self {
        let len = image.len();
        let mem = NonNull::from(image).cast();
        Self {
            input: mem,
            output: Some(mem),
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Translate a page-relative range to an absolute one, if it lies within the image.
    ///
    /// A range may end exactly at the end of the image, so an image of N whole pages yields N
    /// processable pages (decision 1 in DESIGN.md).
    fn locate(&self, page_offset: usize, range: &Range<usize>) -> Option<Range<usize>> {
        let start = page_offset.checked_add(range.start)?;
        let end = page_offset.checked_add(range.end)?;
        (end <= self.len).then_some(start..end)
    }

    /// Copy input bytes into `buf`; `range` must come from [Self::locate] and belong to a page
    /// owned by the calling worker.
    unsafe fn read(&self, range: Range<usize>, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(std::slice::from_raw_parts(
            self.input.as_ptr().add(range.start),
            range.len(),
        ));
    }

    /// Copy `buf` to the output, if there is one; same requirements as [Self::read].
    unsafe fn write(&self, range: Range<usize>, buf: &[u8]) {
        debug_assert_eq!(range.len(), buf.len());
        if let Some(output) = self.output {
            ptr::copy_nonoverlapping(buf.as_ptr(), output.as_ptr().add(range.start), buf.len());
        }
    }
}

/// One page to process: its layout, and the byte offset of its first byte in the image
#[derive(Debug, Copy, Clone)]
pub(crate) struct PageWork<'a> {
    pub layout: &'a SectionLayout,
    pub offset: usize,
}

/// Extracts the codewords of a page and dispatches them to the handler
pub(crate) struct PageProcessor<'a, H: ?Sized> {
    image: Image<'a>,
    page_size: usize,
    handler: &'a H,
    data: Vec<u8>,
    ecc: Vec<u8>,
}

impl<'a, H: CodewordHandler + ?Sized> PageProcessor<'a, H> {
    pub fn new(image: Image<'a>, page_size: usize, handler: &'a H) -> Self {
        Self {
            image,
            page_size,
            handler,
            data: Vec::new(),
            ecc: Vec::new(),
        }
    }

    pub fn process(&mut self, work: PageWork<'_>) -> Result<(), EccError> {
        let layout = work.layout;
        let page = (work.offset / self.page_size) as u32;
        if page & 0xffff == 0 {
            info!("Processing page 0x{page:08x}");
        }

        for ((tag, span), index) in (layout.tag_min..=layout.tag_max)
            .zip(&layout.spans)
            .zip(0u32..)
        {
            let out_of_bounds = |what| EccError::OutOfBounds { page, tag, what };
            let data_range = self
                .image
                .locate(work.offset, &span.data)
                .ok_or_else(|| out_of_bounds("codeword"))?;
            let ecc_range = self
                .image
                .locate(work.offset, &span.ecc)
                .ok_or_else(|| out_of_bounds("ecc"))?;

            // The page at `work.offset` belongs to this worker until `process` returns.
            unsafe {
                self.image.read(data_range.clone(), &mut self.data);
                self.image.read(ecc_range.clone(), &mut self.ecc);
            }

            let mut codeword = Codeword {
                page,
                index,
                data_offset: span.data.start,
                ecc_offset: span.ecc.start,
                data: &mut self.data,
                ecc: &mut self.ecc,
                writable: self.image.has_output(),
            };

            if self.handler.handle(&mut codeword) == Disposition::WriteBack {
                unsafe {
                    self.image.write(data_range, &self.data);
                    self.image.write(ecc_range, &self.ecc);
                }
            }
        }

        Ok(())
    }
}

/// A fixed set of worker threads fed through a [WorkQueue].
///
/// The first error any worker runs into is kept and ends the run: from then on, workers only
/// drain the queue and [post](Self::post) refuses new work.
pub(crate) struct WorkerPool<'a, H: ?Sized> {
    queue: WorkQueue<PageWork<'a>>,
    image: Image<'a>,
    page_size: usize,
    handler: &'a H,
    processed: AtomicU32,
    failed: AtomicBool,
    failure: Mutex<Option<EccError>>,
}

impl<'a, H: CodewordHandler + ?Sized> WorkerPool<'a, H> {
    pub fn new(image: Image<'a>, page_size: usize, handler: &'a H, capacity: usize) -> Self {
        Self {
            queue: WorkQueue::new(capacity),
            image,
            page_size,
            handler,
            processed: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Run `threads` workers while `produce` posts work on the calling thread, then wait for the
    /// workers to drain the queue.
    ///
    /// Returns the number of pages processed.
    pub fn run<F: FnOnce(&Self)>(&self, threads: u32, produce: F) -> Result<u32, EccError> {
        thread::scope(|scope| {
            for id in 0..threads {
                scope.spawn(move || self.work(id));
            }

            // Workers must see the end of the queue even if `produce` panics, or the scope
            // never finishes joining them.
            let _finish = FinishOnDrop(&self.queue);
            produce(self);
            debug!("waiting for threads to finish");
        });

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.processed.load(Ordering::Acquire)),
        }
    }

    /// Queue a page, blocking while the queue is full.
    ///
    /// Returns false once the run has failed, in which case the producer should stop.
    pub fn post(&self, work: PageWork<'a>) -> bool {
        !self.failed.load(Ordering::Acquire) && self.queue.post(work).is_ok()
    }

    fn work(&self, id: u32) {
        debug!("[{id}] Starting thread");

        let _guard = PanicGuard(self);
        let mut processor = PageProcessor::new(self.image, self.page_size, self.handler);
        loop {
            let work = match self.queue.wait() {
                Work::Closed => break,
                Work::Item(_) if self.failed.load(Ordering::Acquire) => continue,
                Work::Item(work) => work,
            };

            match processor.process(work) {
                Ok(()) => {
                    self.processed.fetch_add(1, Ordering::AcqRel);
                }
                Err(error) => self.fail(error),
            }
        }

        debug!("[{id}] Stopping thread");
    }

    fn fail(&self, error: EccError) {
        let mut failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
        self.failed.store(true, Ordering::Release);
    }
}

/// Finishes the queue when dropped
struct FinishOnDrop<'q, T>(&'q WorkQueue<T>);

impl<T> Drop for FinishOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Fails the run if a worker unwinds, so the producer stops instead of blocking on a full queue
/// nobody drains anymore. The panic itself is re-raised when the thread scope joins.
struct PanicGuard<'p, 'a, H: ?Sized>(&'p WorkerPool<'a, H>);

impl<H: ?Sized> Drop for PanicGuard<'_, '_, H> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.failed.store(true, Ordering::Release);
            self.0.queue.finish();
        }
    }
}
