//! Open block contexts tracked while structuring a function.
//!
//! Paths form a tree held in a flat arena; the decompiler walks up through
//! parents when a jump escapes nested blocks, and closes a path when the
//! write cursor reaches its end offset.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    While,
    If,
    Else,
    Main,
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId(usize);

#[derive(Debug)]
pub struct PathNode {
    pub parent: Option<PathId>,
    pub kind: PathKind,
    pub end_offset: i64,
    pub break_offset: i64,
    pub escaped: bool,
    children: Vec<PathId>,
    pub switch: Option<SwitchData>,
}

/// Case bodies of an open switch, keyed by their target offset. The break
/// offset doubles as the default case's offset and is always last.
#[derive(Debug)]
pub struct SwitchData {
    pub cases: HashMap<i64, Vec<String>>,
    pub offsets: Vec<i64>,
    pub escaped_cases: HashMap<i64, bool>,
    pub has_defaulted: bool,
    pub active_offset: i64,
}

#[derive(Debug, Default)]
pub struct PathArena {
    nodes: Vec<PathNode>,
}

impl PathArena {
    pub fn new() -> Self {
        PathArena::default()
    }

    pub fn new_main(&mut self, end_offset: i64, break_offset: i64) -> PathId {
        self.push(None, PathKind::Main, end_offset, break_offset, None)
    }

    pub fn create_child(
        &mut self,
        parent: PathId,
        kind: PathKind,
        end_offset: i64,
        break_offset: i64,
    ) -> PathId {
        self.push(Some(parent), kind, end_offset, break_offset, None)
    }

    /// `offsets` carries the case offsets in emission order (jump-table
    /// order, or sorted for the RDR editions).
    pub fn create_switch(
        &mut self,
        parent: PathId,
        cases: HashMap<i64, Vec<String>>,
        mut offsets: Vec<i64>,
        end_offset: i64,
        break_offset: i64,
    ) -> PathId {
        offsets.push(break_offset);
        let escaped_cases = offsets.iter().map(|&o| (o, false)).collect();
        let switch = SwitchData {
            cases,
            offsets,
            escaped_cases,
            has_defaulted: false,
            active_offset: -1,
        };
        self.push(Some(parent), PathKind::Switch, end_offset, break_offset, Some(switch))
    }

    fn push(
        &mut self,
        parent: Option<PathId>,
        kind: PathKind,
        end_offset: i64,
        break_offset: i64,
        switch: Option<SwitchData>,
    ) -> PathId {
        let id = PathId(self.nodes.len());
        self.nodes.push(PathNode {
            parent,
            kind,
            end_offset,
            break_offset,
            escaped: false,
            children: Vec::new(),
            switch,
        });
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        id
    }

    pub fn node(&self, id: PathId) -> &PathNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: PathId) -> &mut PathNode {
        &mut self.nodes[id.0]
    }

    pub fn parent(&self, id: PathId) -> Option<PathId> {
        self.nodes[id.0].parent
    }

    /// Unlink a closed path from its parent so it no longer participates
    /// in escape tracking.
    pub fn detach(&mut self, id: PathId) {
        if let Some(p) = self.nodes[id.0].parent {
            self.nodes[p.0].children.retain(|&c| c != id);
        }
    }

    pub fn is_switch(&self, id: PathId) -> bool {
        self.nodes[id.0].kind == PathKind::Switch
    }

    /// True when every child (and, for a switch, every case) has been
    /// terminated by a break/return, so falling off the end is unreachable.
    pub fn all_escaped(&self, id: PathId) -> bool {
        let node = &self.nodes[id.0];
        let mut escaped = node.children.iter().all(|&c| self.nodes[c.0].escaped);
        if let Some(switch) = &node.switch {
            escaped &= switch.escaped_cases.values().all(|&e| e);
        }
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_tracking_covers_children_and_cases() {
        let mut arena = PathArena::new();
        let main = arena.new_main(100, -1);
        let if_path = arena.create_child(main, PathKind::If, 50, -1);
        assert!(!arena.all_escaped(main));
        arena.node_mut(if_path).escaped = true;
        assert!(arena.all_escaped(main));

        let mut cases = HashMap::new();
        cases.insert(10i64, vec!["1".to_string()]);
        let sw = arena.create_switch(main, cases, vec![10], 80, 90);
        assert!(!arena.all_escaped(sw));
        let data = arena.node_mut(sw).switch.as_mut().unwrap();
        for v in data.escaped_cases.values_mut() {
            *v = true;
        }
        assert!(arena.all_escaped(sw));
    }

    #[test]
    fn switch_offsets_end_with_break() {
        let mut arena = PathArena::new();
        let main = arena.new_main(100, -1);
        let mut cases = HashMap::new();
        cases.insert(30i64, vec!["2".to_string()]);
        cases.insert(10i64, vec!["1".to_string()]);
        let sw = arena.create_switch(main, cases, vec![10, 30], 80, 90);
        let data = arena.node(sw).switch.as_ref().unwrap();
        assert_eq!(data.offsets, vec![10, 30, 90]);
    }
}
