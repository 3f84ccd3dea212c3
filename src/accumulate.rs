use ndarray::{Array2, Zip};
use tracing::debug;

use crate::{Fragment, GridSpec, Result};

/// 面积加权累加器
///
/// 持有与网格同形的加权和数组以及覆盖掩膜。加权和只在掩膜为`true`的像元上
/// 有意义，[Accumulator::finish]会把其余像元改写为NoData。
///
/// 片段的处理顺序不影响结果，但浮点加法的顺序不同会带来末位差异，
/// 比较结果时应使用相对容差。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_area_rasterize::Result<()> {
/// use geo_area_rasterize::{Accumulator, Extent, Fragment, GridSpec};
///
/// let grid = GridSpec::from_extent(&Extent::new(0., 1., 0., 0.), 1.0)?;
/// let mut acc = Accumulator::new(&grid);
/// acc.add(&Fragment { cell_id: 1, value: Some(10.), area: 0.5 })?;
/// acc.add(&Fragment { cell_id: 1, value: Some(20.), area: 0.5 })?;
///
/// let cells = acc.finish(-9999.);
/// assert_eq!(cells[[0, 0]], 15.);
/// assert_eq!(cells[[0, 1]], -9999.);
/// # Ok(())}
/// ```
#[derive(Debug, Clone)]
pub struct Accumulator {
    grid: GridSpec,
    sums: Array2<f64>,
    covered: Array2<bool>,
}

impl Accumulator {
    pub fn new(grid: &GridSpec) -> Self {
        let shape = (grid.height(), grid.width());
        Accumulator {
            grid: *grid,
            sums: Array2::zeros(shape),
            covered: Array2::from_elem(shape, false),
        }
    }

    /// 将一个片段的贡献`value × area / cell_size²`累加到其像元上，并标记覆盖
    ///
    /// 属性为空的片段没有贡献，也不会标记覆盖。
    ///
    /// # 错误
    /// 像元编号不在`[1, width·height]`内时返回[crate::RasterizeError::CellIdOutOfRange]
    pub fn add(&mut self, fragment: &Fragment) -> Result<()> {
        let (row, col) = self.grid.cell_index(fragment.cell_id)?;
        let Some(value) = fragment.value else {
            debug!(cell_id = fragment.cell_id, "片段属性为空，跳过");
            return Ok(());
        };
        self.sums[[row, col]] += value * (fragment.area / self.grid.cell_area());
        self.covered[[row, col]] = true;
        Ok(())
    }

    /// 覆盖掩膜
    pub fn coverage(&self) -> &Array2<bool> {
        &self.covered
    }

    /// 至少收到一个片段的像元数
    pub fn covered_cells(&self) -> usize {
        self.covered.iter().filter(|covered| **covered).count()
    }

    /// 结束累加，未覆盖的像元写入`nodata`
    pub fn finish(self, nodata: f64) -> Array2<f64> {
        let Accumulator {
            mut sums, covered, ..
        } = self;
        Zip::from(&mut sums)
            .and(&covered)
            .for_each(|sum, &covered| {
                if !covered {
                    *sum = nodata;
                }
            });
        sums
    }
}
