//! Non-fatal diagnostics about malformed debug information.
//!
//! Debuggers traditionally report these once and keep going. A [`Complaints`]
//! value is the sink for one debugging session: each distinct complaint is
//! forwarded to its [`ComplaintSink`] at most once.

use alloc::{boxed::Box, collections::BTreeSet, string::String};
use core::{cell::RefCell, fmt};

use crate::dwarf::parse::SectionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Workaround {
    Align4,
    Align8,
    /// Nothing helped, the rest of the section was dropped.
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complaint {
    CorruptSection {
        section: SectionKind,
        workaround: Workaround,
    },
    SectionDiscarded {
        section: SectionKind,
        reason: String,
    },
    RestoreUnspecified {
        register: u64,
        pc: u64,
    },
    MismatchedRestoreState {
        pc: u64,
    },
    UnspecifiedRegister {
        function: u64,
        regnum: usize,
    },
    UnmappedColumn {
        column: u64,
        pc: u64,
    },
}

impl fmt::Display for Complaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complaint::CorruptSection {
                section,
                workaround: Workaround::Align4,
            } => write!(
                f,
                "Corrupt data in {section}; align 4 workaround apparently succeeded"
            ),
            Complaint::CorruptSection {
                section,
                workaround: Workaround::Align8,
            } => write!(
                f,
                "Corrupt data in {section}; align 8 workaround apparently succeeded"
            ),
            Complaint::CorruptSection {
                section,
                workaround: Workaround::GaveUp,
            } => write!(f, "Corrupt data in {section}"),
            Complaint::SectionDiscarded { section, reason } => {
                write!(f, "skipping {section} info: {reason}")
            }
            Complaint::RestoreUnspecified { register, pc } => write!(
                f,
                "incomplete CFI data; DW_CFA_restore unspecified register #{register} at {pc:#x}"
            ),
            Complaint::MismatchedRestoreState { pc } => {
                write!(f, "bad CFI data; mismatched DW_CFA_restore_state at {pc:#x}")
            }
            Complaint::UnspecifiedRegister { function, regnum } => write!(
                f,
                "incomplete CFI data; unspecified registers (e.g., #{regnum}) at {function:#x}"
            ),
            Complaint::UnmappedColumn { column, pc } => {
                write!(f, "CFI column {column} has no register at {pc:#x}")
            }
        }
    }
}

pub trait ComplaintSink {
    fn complain(&self, complaint: &Complaint);
}

/// Reports complaints as `tracing` warnings.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ComplaintSink for TracingSink {
    fn complain(&self, complaint: &Complaint) {
        warn!("{complaint}");
    }
}

pub struct Complaints {
    sink: Box<dyn ComplaintSink>,
    seen: RefCell<BTreeSet<Complaint>>,
}

impl Complaints {
    pub fn new(sink: Box<dyn ComplaintSink>) -> Self {
        Self {
            sink,
            seen: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn complain(&self, complaint: Complaint) {
        let mut seen = self.seen.borrow_mut();
        if seen.contains(&complaint) {
            return;
        }
        self.sink.complain(&complaint);
        seen.insert(complaint);
    }

    /// Forget what has been reported, so that everything is reported again.
    pub fn clear(&self) {
        self.seen.borrow_mut().clear();
    }
}

impl Default for Complaints {
    fn default() -> Self {
        Self::new(Box::new(TracingSink))
    }
}

impl fmt::Debug for Complaints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Complaints")
            .field("seen", &self.seen.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod recorder {
    use alloc::{rc::Rc, vec::Vec};
    use core::cell::RefCell;

    use super::{Complaint, ComplaintSink, Complaints};

    /// Collects complaints for inspection in tests.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder(Rc<RefCell<Vec<Complaint>>>);

    impl Recorder {
        pub(crate) fn complaints(&self) -> Complaints {
            Complaints::new(alloc::boxed::Box::new(self.clone()))
        }

        pub(crate) fn take(&self) -> Vec<Complaint> {
            core::mem::take(&mut *self.0.borrow_mut())
        }
    }

    impl ComplaintSink for Recorder {
        fn complain(&self, complaint: &Complaint) {
            self.0.borrow_mut().push(complaint.clone());
        }
    }
}
