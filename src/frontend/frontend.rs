use std::rc::Rc;

use log::debug;

use crate::instructions::instructions::{Instr, Program};

/// The instruction stream: the decoded program and the position of the next
/// instruction to fetch. The backend consumes instructions one at a time and
/// redirects the fetch pointer on branches.
#[derive(Debug)]
pub(crate) struct Frontend {
    program: Rc<Program>,
    ip_next_fetch: usize,
}

impl Frontend {
    pub(crate) fn new(program: Rc<Program>) -> Frontend {
        Frontend {
            program,
            ip_next_fetch: 0,
        }
    }

    pub(crate) fn ip_next_fetch(&self) -> usize {
        self.ip_next_fetch
    }

    pub(crate) fn has_next(&self) -> bool {
        self.ip_next_fetch < self.program.len()
    }

    /// The next instruction without consuming it.
    pub(crate) fn peek(&self) -> Option<Rc<Instr>> {
        self.program.get_instr(self.ip_next_fetch)
    }

    pub(crate) fn advance(&mut self) {
        self.ip_next_fetch += 1;
    }

    pub(crate) fn redirect(&mut self, target: usize) {
        debug!("Frontend: ip_next_fetch {} -> {}", self.ip_next_fetch, target);
        self.ip_next_fetch = target;
    }
}
