//! Error modes: one adapter that lets the scheduler and error-mode forks
//! drive `Result`-shaped, `Option`-shaped, or custom result containers.
//!
//! A mode is an ordinary value passed to `supervised_err`, `fork_err` and
//! `retry_with_error_mode`; the container shape is a generic associated
//! type, so no boxing is involved.

/// Classifies a container `Container<T>` as carrying either a value `T` or
/// an error `E`.
pub trait ErrorMode<E>: Copy + Send + Sync + 'static {
    type Container<T>;

    fn is_error<T>(&self, c: &Self::Container<T>) -> bool;

    /// Borrowing view of the container, for code that classifies an outcome
    /// without consuming it (the schedule engine's attempt hook).
    fn peek<'c, T>(&self, c: &'c Self::Container<T>) -> Result<&'c T, &'c E>;

    /// The error inside. Callers check [`is_error`](Self::is_error) first.
    fn get_error<T>(&self, c: Self::Container<T>) -> E;

    /// The value inside. Callers check [`is_error`](Self::is_error) first.
    fn get_value<T>(&self, c: Self::Container<T>) -> T;

    fn pure<T>(&self, value: T) -> Self::Container<T>;

    fn pure_error<T>(&self, error: E) -> Self::Container<T>;
}

/// `Result<T, E>` as the container, for any error type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMode;

impl<E> ErrorMode<E> for ResultMode {
    type Container<T> = Result<T, E>;

    fn is_error<T>(&self, c: &Result<T, E>) -> bool {
        c.is_err()
    }

    fn peek<'c, T>(&self, c: &'c Result<T, E>) -> Result<&'c T, &'c E> {
        c.as_ref()
    }

    fn get_error<T>(&self, c: Result<T, E>) -> E {
        match c {
            Err(e) => e,
            Ok(_) => panic!("get_error on a success container"),
        }
    }

    fn get_value<T>(&self, c: Result<T, E>) -> T {
        match c {
            Ok(v) => v,
            Err(_) => panic!("get_value on an error container"),
        }
    }

    fn pure<T>(&self, value: T) -> Result<T, E> {
        Ok(value)
    }

    fn pure_error<T>(&self, error: E) -> Result<T, E> {
        Err(error)
    }
}

/// `Option<T>` as the container; the absent case is the (unit) error.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionMode;

impl ErrorMode<()> for OptionMode {
    type Container<T> = Option<T>;

    fn is_error<T>(&self, c: &Option<T>) -> bool {
        c.is_none()
    }

    fn peek<'c, T>(&self, c: &'c Option<T>) -> Result<&'c T, &'c ()> {
        c.as_ref().ok_or(&())
    }

    fn get_error<T>(&self, c: Option<T>) {
        debug_assert!(c.is_none());
    }

    fn get_value<T>(&self, c: Option<T>) -> T {
        match c {
            Some(v) => v,
            None => panic!("get_value on an empty container"),
        }
    }

    fn pure<T>(&self, value: T) -> Option<T> {
        Some(value)
    }

    fn pure_error<T>(&self, (): ()) -> Option<T> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_mode() {
        let m = ResultMode;
        let ok: Result<i32, String> = m.pure(3);
        assert!(!m.is_error(&ok));
        assert_eq!(m.get_value(ok), 3);
        let err: Result<i32, String> = m.pure_error("e".to_string());
        assert!(m.is_error(&err));
        assert_eq!(m.get_error(err), "e");
    }

    #[test]
    fn test_option_mode() {
        let m = OptionMode;
        assert_eq!(m.pure(1), Some(1));
        assert!(m.is_error(&None::<i32>));
        assert_eq!(m.get_value(Some(2)), 2);
    }
}
