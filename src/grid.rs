use geo::{Coord, Rect};
use ndarray::Array2;
use num_traits::NumCast;

use crate::{EuclidPoint, RasterizeError, Result, Transform};

/// 轴对齐包围盒，坐标位于输入图层自身的坐标空间中。
///
/// 范围只在运行开始时从图层元数据中读取一次，之后只读。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Extent {
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        Extent {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// x方向跨度
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    /// y方向跨度
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    fn is_finite(&self) -> bool {
        [self.xmin, self.xmax, self.ymin, self.ymax]
            .iter()
            .all(|v| v.is_finite())
    }
}

impl From<Rect<f64>> for Extent {
    fn from(rect: Rect<f64>) -> Self {
        Extent::new(rect.min().x, rect.max().x, rect.min().y, rect.max().y)
    }
}

/// 工作网格的几何描述：尺寸、左下角原点以及像元大小。
///
/// 网格的第0行位于最北端，列向东递增；原点固定在范围的左下角，
/// 因此当跨度不是像元大小的整数倍时，最后一行/列会越过`ymax`/`xmax`。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_area_rasterize::Result<()> {
/// use geo_area_rasterize::{Extent, GridSpec};
///
/// let grid = GridSpec::from_extent(&Extent::new(0., 2.5, 0., 1.), 1.0)?;
/// assert_eq!((grid.width(), grid.height()), (3, 2));
/// # Ok(())}
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    width: usize,
    height: usize,
    origin: Coord<f64>,
    cell_size: f64,
}

impl GridSpec {
    /// 根据范围和像元大小计算网格
    ///
    /// `width = floor((xmax - xmin) / cell_size) + 1`，
    /// `height = floor((ymax - ymin) / cell_size) + 1`。
    ///
    /// # 错误
    /// * 像元大小不是有限正数时返回[RasterizeError::InvalidCellSize]
    /// * 范围含有NaN或无限值时返回[RasterizeError::NonFiniteCoordinate]
    /// * 范围的最小值大于最大值时返回[RasterizeError::InvalidExtent]
    /// * 像元总数无法用`usize`表示时返回[RasterizeError::GridTooLarge]
    pub fn from_extent(extent: &Extent, cell_size: f64) -> Result<Self> {
        if !(cell_size.is_finite() && cell_size > 0.) {
            return Err(RasterizeError::InvalidCellSize(cell_size));
        }
        if !extent.is_finite() {
            return Err(RasterizeError::NonFiniteCoordinate);
        }
        if extent.width() < 0. || extent.height() < 0. {
            return Err(RasterizeError::InvalidExtent);
        }

        let columns = (extent.width() / cell_size).floor();
        let rows = (extent.height() / cell_size).floor();
        // `as`会饱和到usize::MAX，再加一即溢出，所以先比较
        let limit = usize::MAX as f64;
        if columns >= limit || rows >= limit {
            return Err(RasterizeError::GridTooLarge {
                width: usize::MAX,
                height: usize::MAX,
            });
        }
        let width = columns as usize + 1;
        let height = rows as usize + 1;
        if width.checked_mul(height).is_none() {
            return Err(RasterizeError::GridTooLarge { width, height });
        }

        Ok(GridSpec {
            width,
            height,
            origin: Coord {
                x: extent.xmin,
                y: extent.ymin,
            },
            cell_size,
        })
    }

    /// 列数
    pub fn width(&self) -> usize {
        self.width
    }

    /// 行数
    pub fn height(&self) -> usize {
        self.height
    }

    /// 左下角原点
    pub fn origin(&self) -> Coord<f64> {
        self.origin
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// 单个像元的面积，即`cell_size²`
    pub fn cell_area(&self) -> f64 {
        self.cell_size * self.cell_size
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// 网格上边界的y坐标
    pub fn top(&self) -> f64 {
        self.origin.y + self.height as f64 * self.cell_size
    }

    /// 像素坐标到世界坐标的仿射变换
    ///
    /// 像素坐标`(col, row)`以网格左上角为原点，y轴向下。
    pub fn pix_to_geo(&self) -> Transform {
        Transform::new(
            self.cell_size,
            0.,
            0.,
            -self.cell_size,
            self.origin.x,
            self.top(),
        )
    }

    /// 世界坐标到像素坐标的仿射变换，是[GridSpec::pix_to_geo]的逆
    pub fn geo_to_pix(&self) -> Transform {
        let scale = 1. / self.cell_size;
        Transform::new(
            scale,
            0.,
            0.,
            -scale,
            -self.origin.x * scale,
            self.top() * scale,
        )
    }

    /// 第`row`行第`col`列像元在世界坐标中的矩形
    pub fn cell_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let transform = self.pix_to_geo();
        let upper_left = transform.transform_point(EuclidPoint::new(col as f64, row as f64));
        let lower_right =
            transform.transform_point(EuclidPoint::new((col + 1) as f64, (row + 1) as f64));
        Rect::new(upper_left.to_tuple(), lower_right.to_tuple())
    }

    /// 像元的行优先编号，从1开始
    pub fn cell_id(&self, row: usize, col: usize) -> u64 {
        (row * self.width + col + 1) as u64
    }

    /// 将像元编号解码为`(row, col)`
    ///
    /// 编号必须位于`[1, width·height]`之内，否则返回[RasterizeError::CellIdOutOfRange]。
    pub fn cell_index(&self, id: u64) -> Result<(usize, usize)> {
        let cells = self.cell_count();
        if id == 0 || id > cells as u64 {
            return Err(RasterizeError::CellIdOutOfRange { id, cells });
        }
        let index = (id - 1) as usize;
        Ok((index / self.width, index % self.width))
    }
}

/// 生成唯一编号栅格：每个像元的值为其行优先编号`1..=width·height`。
///
/// 下游的栅格转面会把相邻的同值像元合并成一个多边形，唯一编号保证每个像元
/// 单独成面，面积统计才能落到正确的像元上。
///
/// # 错误
/// 最大编号无法用`Label`表示时返回[RasterizeError::GridTooLarge]。
pub fn label_cells<Label>(grid: &GridSpec) -> Result<Array2<Label>>
where
    Label: NumCast + Copy,
{
    let too_large = || RasterizeError::GridTooLarge {
        width: grid.width(),
        height: grid.height(),
    };
    // 编号递增，最大编号能表示则全部能表示
    <Label as NumCast>::from(grid.cell_count()).ok_or_else(too_large)?;
    let labels = (1..=grid.cell_count())
        .map(|id| <Label as NumCast>::from(id).ok_or_else(too_large))
        .collect::<Result<Vec<Label>>>()?;
    Array2::from_shape_vec((grid.height(), grid.width()), labels).map_err(|_| too_large())
}
