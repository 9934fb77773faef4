use crate::task::task::Task;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub(crate) type TaskRef = Arc<Task>;

/// Queue identity stamped onto every enrolled node. Dequeue paths verify the
/// stamp before unlinking, so a task can never be unlinked through a queue it
/// is not currently enrolled in.
pub(crate) type QueueTag = u64;

/// Tag of a task that is not enrolled anywhere.
const DETACHED: QueueTag = 0;

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

fn fresh_tag() -> QueueTag {
    NEXT_TAG.fetch_add(1, Ordering::Relaxed)
}

/// Intrusive link embedded in every task. Guarded by the lock of the queue
/// named by `tag`, or owned exclusively as part of a detached [`TaskList`].
#[derive(Debug)]
pub(in crate::task) struct Node {
    prev: Option<NonNull<Task>>,
    next: Option<NonNull<Task>>,
    tag: QueueTag,
}

impl Node {
    pub(in crate::task) const fn unlinked() -> Self {
        Self {
            prev: None,
            next: None,
            tag: DETACHED,
        }
    }
}

/// # Safety
///
/// The caller must either hold the lock of the queue the node is enrolled in
/// or exclusively own the detached list containing it.
unsafe fn node<'a>(ptr: NonNull<Task>) -> &'a mut Node {
    unsafe { &mut *ptr.as_ref().node.get() }
}

/// Enrollment transfers one strong reference into the raw link.
fn into_raw(task: TaskRef) -> NonNull<Task> {
    // Safety: Arc::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Arc::into_raw(task).cast_mut()) }
}

/// # Safety
///
/// `ptr` must carry a strong reference produced by [`into_raw`]; calling this
/// consumes that reference.
unsafe fn from_raw(ptr: NonNull<Task>) -> TaskRef {
    unsafe { Arc::from_raw(ptr.as_ptr()) }
}

/// # Safety
///
/// `ptr` must point at a live task (one that some queue, list or slot still
/// holds a reference for).
unsafe fn clone_raw(ptr: NonNull<Task>) -> TaskRef {
    unsafe {
        Arc::increment_strong_count(ptr.as_ptr());
        Arc::from_raw(ptr.as_ptr())
    }
}

/// Raw doubly-linked list of enrolled tasks. Every method that touches links
/// is unsafe; [`TaskQueue`], [`RunQueue`] and [`TaskList`] wrap it with their
/// locking / ownership discipline.
struct ListCore {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
    len: usize,
}

impl ListCore {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Append one node, stamping `tag`.
    unsafe fn push_back(&mut self, ptr: NonNull<Task>, tag: QueueTag) {
        unsafe {
            let n = node(ptr);
            debug_assert!(n.prev.is_none() && n.next.is_none(), "task already enrolled");
            n.tag = tag;
            n.prev = self.tail;
            n.next = None;
            match self.tail {
                Some(tail) => node(tail).next = Some(ptr),
                None => self.head = Some(ptr),
            }
        }
        self.tail = Some(ptr);
        self.len += 1;
    }

    /// Unlink a node known to be a member of this list.
    unsafe fn unlink(&mut self, ptr: NonNull<Task>) {
        unsafe {
            let n = node(ptr);
            match n.prev {
                Some(prev) => node(prev).next = n.next,
                None => self.head = n.next,
            }
            match n.next {
                Some(next) => node(next).prev = n.prev,
                None => self.tail = n.prev,
            }
            n.prev = None;
            n.next = None;
            n.tag = DETACHED;
        }
        self.len -= 1;
    }

    fn take(&mut self) -> ListCore {
        std::mem::replace(self, ListCore::new())
    }

    /// Append a whole run in O(1). Stamps are left as they were; peek paths
    /// restamp lazily.
    unsafe fn splice_back(&mut self, other: ListCore) {
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };
        unsafe {
            match self.tail {
                Some(tail) => {
                    node(tail).next = Some(other_head);
                    node(other_head).prev = Some(tail);
                }
                None => self.head = Some(other_head),
            }
        }
        self.tail = Some(other_tail);
        self.len += other.len;
    }

    /// Detach up to `n` nodes from the back, preserving their relative order.
    unsafe fn split_back(&mut self, n: usize) -> ListCore {
        if n == 0 || self.len == 0 {
            return ListCore::new();
        }
        if n >= self.len {
            return self.take();
        }
        unsafe {
            // Walk back to the first node of the detached run; `n < len`, so
            // a predecessor that stays behind always exists.
            let mut first = self.tail.expect("non-empty list without a tail");
            for _ in 1..n {
                first = node(first).prev.expect("list shorter than its len");
            }
            let keep_tail = node(first).prev.expect("split would take the whole list");
            let out = ListCore {
                head: Some(first),
                tail: self.tail,
                len: n,
            };
            node(keep_tail).next = None;
            node(first).prev = None;
            self.tail = Some(keep_tail);
            self.len -= n;
            out
        }
    }
}

/// A detached run of tasks, exclusively owned by its holder. Produced by the
/// bulk-drain and steal paths; consumed by splicing into a queue or by
/// iterating the references out.
pub(crate) struct TaskList {
    core: ListCore,
}

// Safety: the list owns one strong reference per linked task, and nothing
// else can reach those links until the list is spliced or drained.
unsafe impl Send for TaskList {}

impl TaskList {
    pub(crate) const fn new() -> Self {
        Self {
            core: ListCore::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.core.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.core.len == 0
    }

    /// O(1) concatenation.
    pub(crate) fn append(&mut self, other: TaskList) {
        unsafe { self.core.splice_back(other.into_core()) }
    }

    pub(crate) fn push_back(&mut self, task: TaskRef) {
        unsafe { self.core.push_back(into_raw(task), DETACHED) }
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskRef> {
        let head = self.core.head?;
        unsafe {
            self.core.unlink(head);
            Some(from_raw(head))
        }
    }

    /// Remove `task` by identity, returning its reference when it was linked
    /// here. Linear; steal-side lists are short.
    pub(crate) fn erase(&mut self, task: &Task) -> Option<TaskRef> {
        let target = NonNull::from(task);
        let mut cursor = self.core.head;
        while let Some(ptr) = cursor {
            if ptr == target {
                unsafe {
                    self.core.unlink(ptr);
                    return Some(from_raw(ptr));
                }
            }
            cursor = unsafe { node(ptr).next };
        }
        None
    }

    fn into_core(self) -> ListCore {
        let mut list = ManuallyDrop::new(self);
        list.core.take()
    }
}

impl Drop for TaskList {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList").field("len", &self.len()).finish()
    }
}

/// Intrusive locked queue. Used for the inbox (cross-thread ingress) and the
/// wait queue (suspended tasks).
pub(crate) struct TaskQueue {
    tag: QueueTag,
    /// Mirror of the list length maintained under the lock, so producers can
    /// probe emptiness without taking it.
    len: AtomicUsize,
    core: Mutex<ListCore>,
}

// Safety: the raw links are only touched under `core`'s lock, and every
// linked node is kept alive by the strong reference the queue holds for it.
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tag: fresh_tag(),
            len: AtomicUsize::new(0),
            core: Mutex::new(ListCore::new()),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        let ptr = into_raw(task);
        let mut core = self.core.lock();
        unsafe { core.push_back(ptr, self.tag) };
        self.len.store(core.len, Ordering::Relaxed);
    }

    /// Splice a detached run onto the back in O(1).
    pub(crate) fn push_all(&self, list: TaskList) {
        if list.is_empty() {
            return;
        }
        let mut core = self.core.lock();
        unsafe { core.splice_back(list.into_core()) };
        self.len.store(core.len, Ordering::Relaxed);
    }

    pub(crate) fn pop_all(&self) -> TaskList {
        let mut core = self.core.lock();
        let out = core.take();
        self.len.store(0, Ordering::Relaxed);
        TaskList { core: out }
    }

    /// Detach up to `n` tasks from the back; `n == 0` takes everything.
    pub(crate) fn pop_back(&self, n: usize) -> TaskList {
        let mut core = self.core.lock();
        let out = if n == 0 {
            core.take()
        } else {
            unsafe { core.split_back(n) }
        };
        self.len.store(core.len, Ordering::Relaxed);
        TaskList { core: out }
    }

    /// Tag-validated unlink. Returns the queue's reference when `task` was
    /// enrolled here, `None` otherwise.
    pub(crate) fn erase(&self, task: &Task) -> Option<TaskRef> {
        self.lock().erase(task)
    }

    pub(crate) fn lock(&self) -> TaskQueueGuard<'_> {
        TaskQueueGuard {
            tag: self.tag,
            len: &self.len,
            core: self.core.lock(),
        }
    }

    /// Lockless size hint; only for decisions that are re-validated under a
    /// lock.
    pub(crate) fn len_hint(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty_hint(&self) -> bool {
        self.len_hint() == 0
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        drop(TaskList {
            core: self.core.get_mut().take(),
        });
    }
}

pub(crate) struct TaskQueueGuard<'a> {
    tag: QueueTag,
    len: &'a AtomicUsize,
    core: MutexGuard<'a, ListCore>,
}

impl TaskQueueGuard<'_> {
    pub(crate) fn erase(&mut self, task: &Task) -> Option<TaskRef> {
        let ptr = NonNull::from(task);
        unsafe {
            if node(ptr).tag != self.tag {
                return None;
            }
            self.core.unlink(ptr);
        }
        self.len.store(self.core.len, Ordering::Relaxed);
        Some(unsafe { from_raw(ptr) })
    }
}

/// The runnable queue plus the processor's `running`/`next` execution slots,
/// guarded by one mutex so a stealer's view of the slots is serialized with
/// the owner's updates.
pub(crate) struct RunQueue {
    tag: QueueTag,
    len: AtomicUsize,
    core: Mutex<RunCore>,
}

struct RunCore {
    list: ListCore,
    /// Task currently (or most recently) executing on the owning processor.
    /// Usually still enrolled in the list; the suspend path moves it to the
    /// wait queue while the slot still points at it.
    running: Option<NonNull<Task>>,
    /// Staged successor used by the suspend and done paths.
    next: Option<NonNull<Task>>,
}

// Safety: same reasoning as TaskQueue. The slot pointers only ever name tasks
// kept alive by this queue, the owning processor's wait queue or its retired
// pile.
unsafe impl Send for RunQueue {}
unsafe impl Sync for RunQueue {}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            tag: fresh_tag(),
            len: AtomicUsize::new(0),
            core: Mutex::new(RunCore {
                list: ListCore::new(),
                running: None,
                next: None,
            }),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        let ptr = into_raw(task);
        let mut core = self.core.lock();
        unsafe { core.list.push_back(ptr, self.tag) };
        self.len.store(core.list.len, Ordering::Relaxed);
    }

    pub(crate) fn push_all(&self, list: TaskList) {
        if list.is_empty() {
            return;
        }
        let mut core = self.core.lock();
        unsafe { core.list.splice_back(list.into_core()) };
        self.len.store(core.list.len, Ordering::Relaxed);
    }

    pub(crate) fn lock(&self) -> RunQueueGuard<'_> {
        RunQueueGuard {
            tag: self.tag,
            len: &self.len,
            core: self.core.lock(),
        }
    }

    pub(crate) fn running_task(&self) -> Option<TaskRef> {
        self.lock().running()
    }

    pub(crate) fn has_running(&self) -> bool {
        self.core.lock().running.is_some()
    }

    pub(crate) fn len_hint(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty_hint(&self) -> bool {
        self.len_hint() == 0
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        drop(TaskList {
            core: self.core.get_mut().list.take(),
        });
    }
}

pub(crate) struct RunQueueGuard<'a> {
    tag: QueueTag,
    len: &'a AtomicUsize,
    core: MutexGuard<'a, RunCore>,
}

impl RunQueueGuard<'_> {
    fn sync_len(&self) {
        self.len.store(self.core.list.len, Ordering::Relaxed);
    }

    pub(crate) fn running(&self) -> Option<TaskRef> {
        self.core.running.map(|ptr| unsafe { clone_raw(ptr) })
    }

    pub(crate) fn running_ptr(&self) -> Option<NonNull<Task>> {
        self.core.running
    }

    pub(crate) fn next_ptr(&self) -> Option<NonNull<Task>> {
        self.core.next
    }

    /// Point `running` at the queue head, restamping it. Clears the slot when
    /// the queue is empty.
    pub(crate) fn peek_front_as_running(&mut self) -> Option<TaskRef> {
        let head = self.core.list.head;
        self.core.running = head;
        let ptr = head?;
        unsafe {
            node(ptr).tag = self.tag;
            Some(clone_raw(ptr))
        }
    }

    /// Follow the intrusive link from `running`. When a successor exists it
    /// is restamped and becomes the new `running`; otherwise the slot is left
    /// untouched.
    pub(crate) fn advance_running(&mut self) -> Option<TaskRef> {
        let current = self.core.running.expect("advance_running with no running task");
        let successor = unsafe { node(current).next }?;
        unsafe { node(successor).tag = self.tag };
        self.core.running = Some(successor);
        Some(unsafe { clone_raw(successor) })
    }

    pub(crate) fn clear_running(&mut self) {
        self.core.running = None;
    }

    /// Stage `next` as the successor of `running` (restamped). Returns
    /// whether one was found.
    pub(crate) fn compute_next(&mut self) -> bool {
        let current = match self.core.running {
            Some(ptr) => ptr,
            None => {
                self.core.next = None;
                return false;
            }
        };
        let successor = unsafe { node(current).next };
        if let Some(ptr) = successor {
            unsafe { node(ptr).tag = self.tag };
        }
        self.core.next = successor;
        successor.is_some()
    }

    /// `running` := `next`, clearing `next`.
    pub(crate) fn adopt_next(&mut self) -> Option<TaskRef> {
        self.core.running = self.core.next.take();
        self.core.running.map(|ptr| unsafe { clone_raw(ptr) })
    }

    /// Unlink `running` from the list without clearing the slot. The caller
    /// receives the queue's reference and must keep the task alive until the
    /// slot is normalized.
    pub(crate) fn erase_running(&mut self) -> Option<TaskRef> {
        let ptr = self.core.running?;
        unsafe {
            debug_assert_eq!(node(ptr).tag, self.tag, "running task enrolled elsewhere");
            self.core.list.unlink(ptr);
        }
        self.sync_len();
        Some(unsafe { from_raw(ptr) })
    }

    /// Steal-side protection: tag-validated unlink of a slot task.
    pub(crate) fn unlink_if_enrolled(&mut self, ptr: NonNull<Task>) -> Option<TaskRef> {
        unsafe {
            if node(ptr).tag != self.tag {
                return None;
            }
            self.core.list.unlink(ptr);
        }
        self.sync_len();
        Some(unsafe { from_raw(ptr) })
    }

    /// Detach up to `n` tasks from the back; `n == 0` takes everything.
    pub(crate) fn harvest_back(&mut self, n: usize) -> TaskList {
        let core = if n == 0 {
            self.core.list.take()
        } else {
            unsafe { self.core.list.split_back(n) }
        };
        self.sync_len();
        TaskList { core }
    }

    pub(crate) fn push_back(&mut self, task: TaskRef) {
        unsafe { self.core.list.push_back(into_raw(task), self.tag) };
        self.sync_len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task::Task;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskQueue: Send, Sync);
    assert_impl_all!(RunQueue: Send, Sync);
    assert_impl_all!(TaskList: Send);

    const TEST_STACK: usize = 64 * 1024;

    fn task(id: u64) -> TaskRef {
        Task::new(id, TEST_STACK, || {}).expect("test task")
    }

    fn ids(mut list: TaskList) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(task) = list.pop_front() {
            out.push(task.id());
        }
        out
    }

    #[test]
    fn push_preserves_fifo_order() {
        let queue = TaskQueue::new();
        for id in 1..=4 {
            queue.push(task(id));
        }
        assert_eq!(queue.len_hint(), 4);
        assert_eq!(ids(queue.pop_all()), vec![1, 2, 3, 4]);
        assert!(queue.is_empty_hint());
    }

    #[test]
    fn pop_back_detaches_the_tail_run() {
        let queue = TaskQueue::new();
        for id in 1..=5 {
            queue.push(task(id));
        }
        let stolen = queue.pop_back(2);
        assert_eq!(ids(stolen), vec![4, 5]);
        assert_eq!(queue.len_hint(), 3);
        assert_eq!(ids(queue.pop_all()), vec![1, 2, 3]);
    }

    #[test]
    fn pop_back_caps_at_len_and_zero_takes_all() {
        let queue = TaskQueue::new();
        for id in 1..=3 {
            queue.push(task(id));
        }
        assert_eq!(queue.pop_back(10).len(), 3);

        for id in 1..=3 {
            queue.push(task(id));
        }
        assert_eq!(queue.pop_back(0).len(), 3);
        assert!(queue.is_empty_hint());
    }

    #[test]
    fn erase_validates_the_queue_tag() {
        let queue = TaskQueue::new();
        let other = TaskQueue::new();
        let t = task(7);
        queue.push(t.clone());

        // Enrolled in `queue`, so `other` must refuse to unlink it.
        assert!(other.erase(&t).is_none());
        assert_eq!(other.len_hint(), 0);

        let erased = queue.erase(&t).expect("enrolled task erases");
        assert_eq!(erased.id(), 7);
        assert!(queue.is_empty_hint());

        // Already detached: a second erase is a no-op.
        assert!(queue.erase(&t).is_none());
    }

    #[test]
    fn splice_keeps_order_across_queues() {
        let inbox = TaskQueue::new();
        let run = TaskQueue::new();
        run.push(task(1));
        for id in 2..=4 {
            inbox.push(task(id));
        }

        run.push_all(inbox.pop_all());
        assert_eq!(run.len_hint(), 4);
        assert_eq!(ids(run.pop_all()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn spliced_tasks_erase_after_restamp_only() {
        let inbox = TaskQueue::new();
        let run = TaskQueue::new();
        let t = task(1);
        inbox.push(t.clone());
        run.push_all(inbox.pop_all());

        // The splice did not restamp, so the node still carries the inbox
        // tag until a peek path touches it.
        assert!(run.erase(&t).is_none());
        assert!(inbox.erase(&t).is_some());
    }

    #[test]
    fn task_list_erase_by_identity() {
        let queue = TaskQueue::new();
        let t2 = task(2);
        queue.push(task(1));
        queue.push(t2.clone());
        queue.push(task(3));

        let mut list = queue.pop_all();
        assert_eq!(list.erase(&t2).map(|t| t.id()), Some(2));
        assert!(list.erase(&t2).is_none());
        assert_eq!(ids(list), vec![1, 3]);
    }

    #[test]
    fn run_queue_slots_follow_the_links() {
        let run = RunQueue::new();
        for id in 1..=3 {
            run.push(task(id));
        }

        let mut guard = run.lock();
        assert_eq!(guard.peek_front_as_running().map(|t| t.id()), Some(1));
        assert!(guard.compute_next());
        assert_eq!(guard.adopt_next().map(|t| t.id()), Some(2));
        assert_eq!(guard.advance_running().map(|t| t.id()), Some(3));
        // 3 is the tail: no successor, slot untouched.
        assert!(guard.advance_running().is_none());
        assert_eq!(guard.running().map(|t| t.id()), Some(3));
    }

    #[test]
    fn erase_running_keeps_the_slot() {
        let run = RunQueue::new();
        run.push(task(1));
        run.push(task(2));

        let mut guard = run.lock();
        guard.peek_front_as_running();
        let erased = guard.erase_running().expect("running is enrolled");
        assert_eq!(erased.id(), 1);
        assert_eq!(run.len_hint(), 1);
        // Slot still names the erased task until the owner normalizes it.
        assert_eq!(guard.running().map(|t| t.id()), Some(1));
    }

    #[test]
    fn harvest_back_skips_relinked_running() {
        let run = RunQueue::new();
        for id in 1..=4 {
            run.push(task(id));
        }

        let mut guard = run.lock();
        guard.peek_front_as_running();
        let running = guard.running_ptr().expect("slot set");
        let protected = guard.unlink_if_enrolled(running).expect("enrolled");
        let stolen = guard.harvest_back(0);
        guard.push_back(protected);
        drop(guard);

        assert_eq!(ids(stolen), vec![2, 3, 4]);
        assert_eq!(run.len_hint(), 1);
        assert_eq!(run.running_task().map(|t| t.id()), Some(1));
    }

    #[test]
    fn dropping_a_list_releases_its_tasks() {
        let queue = TaskQueue::new();
        let t = task(1);
        queue.push(t.clone());
        let list = queue.pop_all();
        assert_eq!(Arc::strong_count(&t), 2);
        drop(list);
        assert_eq!(Arc::strong_count(&t), 1);
    }
}
