/// Hands out default identifiers for objects created without one.
///
/// The counter lives in whatever owns the generator (usually a manager), so
/// two managers never share numbering and a test can [`reset`](Self::reset)
/// it between runs.
#[derive(Debug, Default, Clone)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `"{prefix}_{n}"` and advances the counter.
    pub fn next(&mut self, prefix: &str) -> String {
        let id = format!("{}_{}", prefix, self.next);
        self.next += 1;
        id
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_and_resettable() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next("object"), "object_0");
        assert_eq!(ids.next("object"), "object_1");
        assert_eq!(ids.next("material"), "material_2");
        ids.reset();
        assert_eq!(ids.next("object"), "object_0");
    }
}
