use std::{fmt, fs, io, path::Path};
use term_data_table::{Cell, Row};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Print an underlined section header.
pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

/// A table row from anything displayable.
pub fn row<D: fmt::Display>(cells: impl IntoIterator<Item = D>) -> Row<'static> {
    cells
        .into_iter()
        .fold(Row::new(), |row, cell| row.with_cell(Cell::from(cell.to_string())))
}

/// Displays a number with `,` between each group of three digits.
#[derive(Debug, Copy, Clone)]
pub struct Thousands(pub u64);

impl fmt::Display for Thousands {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let digits = self.0.to_string();
        let first = digits.len() % 3;
        f.write_str(&digits[..first])?;
        for (idx, chunk) in digits.as_bytes()[first..].chunks(3).enumerate() {
            if idx > 0 || first > 0 {
                f.write_str(",")?;
            }
            // only ascii digits
            f.write_str(std::str::from_utf8(chunk).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

// error printing helper.
//
pub trait ResultExt {
    fn print_error(self) -> Self;
}

impl<T> ResultExt for Result<T, anyhow::Error> {
    fn print_error(self) -> Self {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                eprintln!("error: {}", error);
                let mut err: &dyn std::error::Error = error.as_ref();
                while let Some(cause) = err.source() {
                    eprintln!("caused by: {}", cause);
                    err = cause;
                }
                Err(error)
            }
        }
    }
}
