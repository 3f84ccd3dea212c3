use std::{fmt::Display, io::Write};

use itertools::Itertools;
use ndarray::Array2;

use crate::GridSpec;

/// 以ESRI ASCII grid格式写出栅格
///
/// 头部依次为`ncols`、`nrows`、`xllcorner`、`yllcorner`、`cellsize`，
/// 有NoData时再写`NODATA_value`；随后每行一个栅格行，从最北的一行开始。
pub fn write_ascii_grid<W, T>(
    writer: &mut W,
    cells: &Array2<T>,
    grid: &GridSpec,
    nodata: Option<f64>,
) -> std::io::Result<()>
where
    W: Write,
    T: Display,
{
    let (nrows, ncols) = cells.dim();
    writeln!(writer, "ncols {ncols}")?;
    writeln!(writer, "nrows {nrows}")?;
    writeln!(writer, "xllcorner {}", grid.origin().x)?;
    writeln!(writer, "yllcorner {}", grid.origin().y)?;
    writeln!(writer, "cellsize {}", grid.cell_size())?;
    if let Some(nodata) = nodata {
        writeln!(writer, "NODATA_value {nodata}")?;
    }
    for row in cells.rows() {
        writeln!(writer, "{}", row.iter().join(" "))?;
    }
    Ok(())
}
