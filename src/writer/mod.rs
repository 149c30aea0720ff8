// This module implements the writer pipeline that sits between a function builder and its
// instruction buffer. A pipeline is an ordered chain of filters; each filter sees one
// instruction, may rewrite it, answer it with an existing handle, or pass it further down,
// and the end of the chain appends to the buffer. Filters are trait objects so the chain can
// be assembled per function from the context options: validators at both ends, the
// algebraic filter, CSE and the verbose writer, in that order of traversal.

//! Writer pipeline: chained instruction filters in front of a [`LirBuffer`].

pub mod cse;
pub mod expr;
pub mod validate;
pub mod verbose;

pub use cse::CseFilter;
pub use expr::ExprFilter;
pub use validate::ValidateWriter;
pub use verbose::VerboseWriter;

use crate::core::config::JitConfig;
use crate::core::session::CompilationSession;
use crate::lir::{LIns, LInsData, LirBuffer};

/// One stage of the writer pipeline.
pub trait LirFilter<'a> {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Accept the next instruction and return the handle that stands for it.
    ///
    /// A stage either forwards through `out` (possibly after rewriting, or
    /// after emitting helper instructions) or answers with a handle that was
    /// produced earlier.
    fn ins(&mut self, ins: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns;

    /// Publish counters into the session statistics.
    fn report(&self, _session: &CompilationSession<'_>) {}
}

/// The part of the pipeline below a stage, ending in the buffer.
pub struct Downstream<'p, 'a> {
    stages: &'p mut [Box<dyn LirFilter<'a> + 'a>],
    buffer: &'p mut LirBuffer<'a>,
}

impl<'p, 'a> Downstream<'p, 'a> {
    /// Pass an instruction to the next stage, or append it when no stage is left.
    pub fn ins(&mut self, data: LInsData<'a>) -> LIns {
        let buffer = &mut *self.buffer;
        match self.stages.split_first_mut() {
            Some((stage, rest)) => {
                let mut next = Downstream {
                    stages: rest,
                    buffer,
                };
                stage.ins(data, &mut next)
            }
            None => buffer.append(data),
        }
    }

    /// The buffer everything ends up in; every handle seen by a stage points into it.
    pub fn buffer(&self) -> &LirBuffer<'a> {
        self.buffer
    }
}

/// Ordered stack of filters. Index 0 sees instructions first.
pub struct WriterPipeline<'a> {
    stages: Vec<Box<dyn LirFilter<'a> + 'a>>,
}

impl<'a> WriterPipeline<'a> {
    /// Pipeline with no filters: instructions go straight to the buffer.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Assemble the pipeline for one function.
    ///
    /// Built from the sink outwards: end validator (optimizing builds only),
    /// verbose writer, CSE, algebraic filter, start validator.
    pub fn build(config: &JitConfig, optimize: bool) -> Self {
        let mut pipeline = Self::new();
        if optimize && config.validate {
            pipeline.push_outer(Box::new(ValidateWriter::new("end of writer pipeline")));
        }
        if config.verbose {
            pipeline.push_outer(Box::new(VerboseWriter::new()));
        }
        if optimize && config.cse {
            pipeline.push_outer(Box::new(CseFilter::new()));
        }
        if optimize && config.expr_filter {
            pipeline.push_outer(Box::new(ExprFilter::new()));
        }
        if config.validate {
            pipeline.push_outer(Box::new(ValidateWriter::new("start of writer pipeline")));
        }
        log::trace!("writer pipeline: {:?}", pipeline.stage_names());
        pipeline
    }

    /// Wrap the current pipeline in a new outermost stage.
    pub fn push_outer(&mut self, stage: Box<dyn LirFilter<'a> + 'a>) {
        self.stages.insert(0, stage);
    }

    /// Feed one instruction through every stage into `buffer`.
    pub fn ins(&mut self, buffer: &mut LirBuffer<'a>, data: LInsData<'a>) -> LIns {
        let mut out = Downstream {
            stages: self.stages.as_mut_slice(),
            buffer,
        };
        out.ins(data)
    }

    /// Stage names in traversal order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn report(&self, session: &CompilationSession<'_>) {
        for stage in &self.stages {
            stage.report(session);
        }
    }
}

impl Default for WriterPipeline<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::LOpcode;
    use bumpalo::Bump;

    /// Counts what passes through.
    struct Counter<'c> {
        seen: &'c std::cell::Cell<usize>,
    }

    impl<'a, 'c> LirFilter<'a> for Counter<'c> {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn ins(&mut self, ins: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns {
            self.seen.set(self.seen.get() + 1);
            out.ins(ins)
        }
    }

    #[test]
    fn test_stage_order() {
        let config = JitConfig::default().with_validate(true).with_verbose(true);
        let pipeline = WriterPipeline::build(&config, true);
        assert_eq!(
            pipeline.stage_names(),
            vec!["validate", "expr", "cse", "verbose", "validate"]
        );

        let plain = WriterPipeline::build(&config.clone().with_verbose(false), false);
        assert_eq!(plain.stage_names(), vec!["validate"]);
    }

    #[test]
    fn test_empty_pipeline_appends() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let mut pipeline = WriterPipeline::new();
        let start = pipeline.ins(&mut buf, LInsData::op0(LOpcode::Start));
        assert_eq!(start.index(), 0);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_custom_stage_sees_every_instruction() {
        let arena = Bump::new();
        let seen = std::cell::Cell::new(0);
        let mut buf = LirBuffer::new(&arena, 0);
        let mut pipeline = WriterPipeline::new();
        pipeline.push_outer(Box::new(Counter { seen: &seen }));
        pipeline.push_outer(Box::new(CseFilter::new()));

        let a = pipeline.ins(&mut buf, LInsData::immi(1));
        let b = pipeline.ins(&mut buf, LInsData::immi(1));
        assert_eq!(a, b);
        assert_eq!(seen.get(), 1);
        assert_eq!(buf.len(), 1);
    }
}
