//! Line-info recorder (component B).
//!
//! One entry per emitted instruction: either a signed delta from the
//! previous instruction's line, or the sentinel [`ABSLINEINFO`] pointing at
//! an absolute anchor recorded out of band in `abslineinfo`.

/// Sentinel byte signalling "see the next unused `abslineinfo` anchor".
/// `i8::MIN` so it can never collide with a real (and much smaller) delta.
pub const ABSLINEINFO: i8 = i8::MIN;

/// Lines may drift at most this much between two instructions before an
/// absolute anchor is forced; a delta of exactly this magnitude does not
/// fit distinctly from [`ABSLINEINFO`] in a signed byte.
pub const LIM_LINE_DIFF: i32 = 0x80;

/// Absolute anchors are re-inserted at least this often even when deltas
/// stay small, bounding how far a reader must walk to reconstruct a line.
pub const MAX_IWTHABS: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: i32,
}

#[derive(Debug, Default)]
pub struct LineInfoRecorder {
    pub lineinfo: Vec<i8>,
    pub abslineinfo: Vec<AbsLineInfo>,
    pub previousline: i32,
    pub iwthabs: u32,
}

impl LineInfoRecorder {
    /// Record line info for the instruction just appended at `pc - 1`.
    pub fn save(&mut self, pc: u32, line: i32) {
        let linedif = line - self.previousline;
        if linedif.abs() >= LIM_LINE_DIFF || self.iwthabs >= MAX_IWTHABS {
            log::trace!("absolute line-info anchor at pc {} (line {})", pc - 1, line);
            self.abslineinfo.push(AbsLineInfo { pc: pc - 1, line });
            self.lineinfo.push(ABSLINEINFO);
            self.iwthabs = 0;
        } else {
            self.lineinfo.push(linedif as i8);
        }
        self.iwthabs += 1;
        self.previousline = line;
    }

    /// Undo the line info of the instruction currently at `pc - 1`, in
    /// preparation for either removing that instruction or re-saving it
    /// under a different line (`fixline`).
    pub fn rewind(&mut self, pc: u32) {
        let last = self.lineinfo[(pc - 1) as usize];
        if last != ABSLINEINFO {
            self.previousline -= last as i32;
            self.iwthabs -= 1;
        } else {
            let anchor = self.abslineinfo.pop().expect("abslineinfo underflow");
            debug_assert_eq!(anchor.pc, pc - 1);
            self.iwthabs = MAX_IWTHABS + 1;
        }
        self.lineinfo.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_deltas_are_relative() {
        let mut r = LineInfoRecorder::default();
        r.save(1, 1);
        r.save(2, 2);
        r.save(3, 4);
        assert_eq!(r.lineinfo, vec![1, 1, 2]);
        assert!(r.abslineinfo.is_empty());
    }

    #[test]
    fn large_delta_forces_absolute() {
        let mut r = LineInfoRecorder::default();
        r.save(1, 1);
        r.save(2, 1 + LIM_LINE_DIFF);
        assert_eq!(r.lineinfo[1], ABSLINEINFO);
        assert_eq!(r.abslineinfo.len(), 1);
        assert_eq!(r.abslineinfo[0], AbsLineInfo { pc: 1, line: 1 + LIM_LINE_DIFF });
    }

    #[test]
    fn exact_boundary_delta_forces_absolute() {
        let mut r = LineInfoRecorder::default();
        r.save(1, 0);
        r.save(2, LIM_LINE_DIFF);
        assert_eq!(r.lineinfo[1], ABSLINEINFO);
    }

    #[test]
    fn periodic_anchor_after_max_iwthabs() {
        let mut r = LineInfoRecorder::default();
        let mut pc = 0u32;
        for line in 1..=121 {
            pc += 1;
            r.save(pc, line);
        }
        // instructions 1..=120 (iwthabs counts 0..120) are relative; the
        // 121st forces an absolute anchor, regardless of its (tiny) delta.
        assert_eq!(r.lineinfo.len(), 121);
        assert_eq!(r.lineinfo[120], ABSLINEINFO);
        assert!(r.lineinfo[..120].iter().all(|&b| b != ABSLINEINFO));
    }

    #[test]
    fn rewind_relative_restores_previousline() {
        let mut r = LineInfoRecorder::default();
        r.save(1, 10);
        r.save(2, 15);
        r.rewind(2);
        assert_eq!(r.previousline, 10);
        assert_eq!(r.lineinfo.len(), 1);
    }

    #[test]
    fn rewind_absolute_forces_next_absolute() {
        let mut r = LineInfoRecorder::default();
        r.save(1, 1);
        r.save(2, 1 + LIM_LINE_DIFF);
        r.rewind(2);
        assert!(r.abslineinfo.is_empty());
        assert_eq!(r.iwthabs, MAX_IWTHABS + 1);
        r.save(2, 999);
        assert_eq!(r.lineinfo[1], ABSLINEINFO);
    }
}
