use std::collections::VecDeque;

use io_uring::squeue;

/// User data value carried by entries whose completions nobody consumes. The dispatcher drops
/// these on the floor; only the final entry of a linked chain carries a real token.
pub const NULL_TOKEN: u64 = 0;

/// Outcome of delivering a completion to its handler.
pub enum OpStatus {
    /// Handler wants its next round of entries staged; `prepare` is called again under the
    /// same token.
    Rearm,
    /// Handler is finished; its slot and token are released.
    Release,
}

/// One in-flight operation owner. `prepare` stages the entries for the handler's current
/// state, `complete` consumes the result of the tokened entry and decides what happens next.
/// Handlers never touch the ring directly; everything goes through the staging sink so a
/// completion can never reentrantly grow the submission queue it is being drained from.
pub trait OpHandler {
    fn prepare(&mut self, sink: &mut SqeSink);
    fn complete(&mut self, res: i32) -> OpStatus;
}

/// Staging sink handed to [OpHandler::prepare]. Entries pushed here are flushed to the
/// submission ring in order on the next flush, so a `chain`/`submit` pair lands adjacently
/// and the kernel sees the link intact.
pub struct SqeSink<'a> {
    token: u64,
    staged: &'a mut VecDeque<squeue::Entry>,
    limit: usize,
    overflowed: bool,
}

impl<'a> SqeSink<'a> {
    pub(crate) fn new(
        token: u64,
        staged: &'a mut VecDeque<squeue::Entry>,
        limit: usize,
    ) -> SqeSink<'a> {
        SqeSink {
            token,
            staged,
            limit,
            overflowed: false,
        }
    }

    /// Stage a link-predecessor entry. Its completion is anonymous and its failure is
    /// observed through the cancellation of the entry that follows it.
    pub fn chain(&mut self, entry: squeue::Entry) {
        self.push(
            entry
                .flags(squeue::Flags::IO_LINK)
                .user_data(NULL_TOKEN),
        );
    }

    /// Stage the tokened entry whose completion comes back to this handler.
    pub fn submit(&mut self, entry: squeue::Entry) {
        let token = self.token;
        self.push(entry.user_data(token));
    }

    fn push(&mut self, entry: squeue::Entry) {
        if self.staged.len() >= self.limit {
            self.overflowed = true;
            return;
        }
        self.staged.push_back(entry);
    }

    pub(super) fn overflowed(&self) -> bool {
        self.overflowed
    }
}
