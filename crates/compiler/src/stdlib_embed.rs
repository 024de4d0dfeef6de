//! Embedded Ed library
//!
//! The `Ed.*` helpers are ordinary Ed.Py source compiled into every
//! program, so the compiler, not the robot firmware, owns the high-level
//! library. Embedding the source makes the compiler fully self-contained.

/// The Ed library source. Parsed with the normal parser; `Ed_` function
/// names are rewritten to `Ed.` and the results marked internal.
pub fn ed_library_source() -> &'static str {
    include_str!("../stdlib/ed.py")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_has_the_core_helpers() {
        let src = ed_library_source();
        assert!(src.contains("def Ed_LeftLed"));
        assert!(src.contains("def Ed_Drive_CM"));
        assert!(src.contains("def Ed_TimeWait"));
        assert!(src.contains("def abs"));
    }

    #[test]
    fn library_imports_ed() {
        assert!(ed_library_source().starts_with("# Ed module library")
            || ed_library_source().contains("import Ed"));
    }
}
