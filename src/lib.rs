#![doc = include_str!("../README.md")]
use std::path::Path;

use euclid::{Transform2D, UnknownUnit};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

mod accumulate;
pub use accumulate::Accumulator;
mod ascii;
pub use ascii::write_ascii_grid;
mod fgb;
pub use fgb::read_flatgeobuf;
mod grid;
pub use grid::{label_cells, Extent, GridSpec};
mod memory;
pub use memory::{Feature, FieldValue, GeoService, Layer};
mod service;
pub use service::{
    DatasetId, FieldKind, Fragment, FragmentCursor, GeometryRasterService, RasterCells, Scratch,
    Stage,
};
#[cfg(test)]
mod proptests;

/// 仿射变换，描述像素坐标与世界坐标之间的映射。
pub type Transform = Transform2D<f64, UnknownUnit, UnknownUnit>;
/// 欧几里得点类型，用于内部坐标计算和转换操作。
pub(crate) type EuclidPoint = euclid::Point2D<f64, UnknownUnit>;

/// 网格面图层中保存像元编号的属性名
pub const CELL_ID_FIELD: &str = "cell_id";

/// 本库的错误类型
#[derive(Error, Clone, Debug, PartialEq)]
pub enum RasterizeError {
    /// 像元大小必须是有限的正数
    #[error("像元大小必须是有限的正数，实际为 {0}")]
    InvalidCellSize(f64),

    /// 构建器中缺少必需的`cell_size`参数
    #[error("构建器中缺少必需的`cell_size`参数")]
    MissingCellSize,

    /// 范围中至少有一个坐标是NaN或无限的
    #[error("范围中至少有一个坐标是NaN或无限的")]
    NonFiniteCoordinate,

    /// 范围的最小值大于最大值
    #[error("范围的最小值大于最大值")]
    InvalidExtent,

    /// 像元编号超出标签类型或`usize`的表示范围
    #[error("{width}x{height} 网格的像元编号超出可表示范围")]
    GridTooLarge { width: usize, height: usize },

    #[error("找不到数据集 `{0}`")]
    LayerNotFound(String),

    /// 图层没有任何非空几何，范围无定义
    #[error("图层 `{0}` 没有要素，无法确定范围")]
    EmptyLayer(String),

    #[error("图层 `{layer}` 没有名为 `{field}` 的字段")]
    MissingField { layer: String, field: String },

    #[error("图层 `{layer}` 的字段 `{field}` 不是数值类型")]
    NonNumericField { layer: String, field: String },

    /// 输入图层中含有非面几何
    #[error("不支持的几何类型 `{0}`，只接受面要素")]
    UnsupportedGeometry(String),

    /// 片段引用的像元编号不在`[1, cells]`内
    #[error("像元编号 {id} 超出网格范围 [1, {cells}]")]
    CellIdOutOfRange { id: u64, cells: usize },

    /// 外部几何/栅格服务在某个阶段失败
    #[error("{stage}失败：{message}")]
    Service { stage: Stage, message: String },

    /// 读写文件失败
    #[error("读写 `{path}` 失败：{message}")]
    Io { path: String, message: String },
}

/// 本库使用的结果类型，使用[RasterizeError]作为错误类型。
pub type Result<T> = std::result::Result<T, RasterizeError>;

/// [AreaWeighted]的构建器
///
/// 字段名是唯一必须在构造时给出的参数，因此构建器从[AreaWeightedBuilder::field]开始。
/// `cell_size`必须设置；`nodata`默认为`-9999.0`。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_area_rasterize::Result<()> {
/// use geo_area_rasterize::AreaWeightedBuilder;
///
/// let rasterizer = AreaWeightedBuilder::field("population").cell_size(250.).build()?;
/// assert_eq!(rasterizer.nodata(), -9999.);
/// # Ok(())}
/// ```
#[derive(Debug, Clone)]
pub struct AreaWeightedBuilder {
    field: String,
    cell_size: Option<f64>,
    nodata: Option<f64>,
}

impl AreaWeightedBuilder {
    /// 以参与加权的数值字段名创建构建器
    pub fn field(field: impl Into<String>) -> Self {
        AreaWeightedBuilder {
            field: field.into(),
            cell_size: None,
            nodata: None,
        }
    }

    /// 设置像元大小，单位与输入图层坐标一致
    pub fn cell_size(mut self, cell_size: f64) -> Self {
        self.cell_size = Some(cell_size);
        self
    }

    /// 设置未被任何多边形覆盖的像元所写入的NoData值
    pub fn nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    /// 构建栅格化器
    ///
    /// # 错误
    /// 缺少像元大小时返回[RasterizeError::MissingCellSize]，
    /// 像元大小不是有限正数时返回[RasterizeError::InvalidCellSize]。
    pub fn build(self) -> Result<AreaWeighted> {
        let cell_size = self.cell_size.ok_or(RasterizeError::MissingCellSize)?;
        AreaWeighted::new(self.field, cell_size, self.nodata.unwrap_or(-9999.))
    }
}

/// 一次栅格化运行的概要
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// 输出栅格的网格
    pub grid: GridSpec,
    /// 参与累加的片段数
    pub fragments: usize,
    /// 至少被一个片段覆盖的像元数
    pub covered_cells: usize,
}

/// 面积加权栅格化器
///
/// 每个输出像元的值为覆盖它的所有多边形的`属性值 × 重叠面积 / 像元面积`之和；
/// 没有被任何多边形覆盖的像元为NoData。
///
/// 处理分五个严格顺序的阶段：
/// 1. 从输入图层范围和像元大小确定网格
/// 2. 生成行优先、从1开始的唯一编号栅格
/// 3. 编号栅格转面，再与输入图层相交
/// 4. 逐片段累加加权值并记录覆盖掩膜
/// 5. 未覆盖像元写入NoData，构建并保存输出栅格
///
/// 几何与栅格操作全部委托给[GeometryRasterService]。第3阶段产生的临时数据集
/// 由[Scratch]守卫持有，任何退出路径上都会被删除。
#[derive(Debug, Clone, PartialEq)]
pub struct AreaWeighted {
    field: String,
    cell_size: f64,
    nodata: f64,
}

impl AreaWeighted {
    /// 创建栅格化器
    ///
    /// # 错误
    /// 像元大小不是有限正数时返回[RasterizeError::InvalidCellSize]
    pub fn new(field: impl Into<String>, cell_size: f64, nodata: f64) -> Result<Self> {
        if !(cell_size.is_finite() && cell_size > 0.) {
            return Err(RasterizeError::InvalidCellSize(cell_size));
        }
        Ok(AreaWeighted {
            field: field.into(),
            cell_size,
            nodata,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    /// 栅格化`input`图层并将结果保存到`destination`
    ///
    /// 保存是最后一步，失败时不会留下输出栅格；临时数据集在返回前总会被删除。
    ///
    /// # 错误
    /// * 字段不存在或不是数值类型时返回[RasterizeError::MissingField]或
    ///   [RasterizeError::NonNumericField]，此时还没有创建任何数据集
    /// * 图层没有几何时返回[RasterizeError::EmptyLayer]
    /// * 外部服务失败时返回[RasterizeError::Service]，其中注明失败的阶段
    /// * 写出失败时返回[RasterizeError::Io]
    pub fn rasterize<S>(
        &self,
        service: &S,
        input: &DatasetId,
        destination: &Path,
    ) -> Result<RunSummary>
    where
        S: GeometryRasterService + ?Sized,
    {
        let span = info_span!(
            "rasterize",
            layer = %input,
            field = %self.field,
            cell_size = self.cell_size
        );
        let _enter = span.enter();

        match service.field_kind(input, &self.field)? {
            Some(kind) if kind.is_numeric() => {}
            Some(_) => {
                return Err(RasterizeError::NonNumericField {
                    layer: input.to_string(),
                    field: self.field.clone(),
                })
            }
            None => {
                return Err(RasterizeError::MissingField {
                    layer: input.to_string(),
                    field: self.field.clone(),
                })
            }
        }

        let extent = service.extent(input)?;
        let grid = GridSpec::from_extent(&extent, self.cell_size)?;
        info!(width = grid.width(), height = grid.height(), "网格已确定");

        let id_field = grid_id_field(service, input)?;
        let labels = label_cells::<u32>(&grid)?;
        let labeled = Scratch::new(
            service,
            service.array_to_raster(RasterCells::Labels(labels), &grid, None)?,
        );
        let polygrid = Scratch::new(
            service,
            service.vectorize(labeled.id(), &id_field, false)?,
        );
        let intersected = Scratch::new(service, service.intersect(polygrid.id(), input)?);

        let mut accumulator = Accumulator::new(&grid);
        let mut fragments = 0;
        for fragment in service.fragments(intersected.id(), &id_field, &self.field)? {
            accumulator.add(&fragment?)?;
            fragments += 1;
        }
        let covered_cells = accumulator.covered_cells();
        if covered_cells == 0 {
            warn!("没有像元被覆盖，输出栅格全部为NoData");
        }

        let output = Scratch::new(
            service,
            service.array_to_raster(
                RasterCells::Values(accumulator.finish(self.nodata)),
                &grid,
                Some(self.nodata),
            )?,
        );
        service.save(output.id(), destination)?;
        info!(
            fragments,
            covered_cells,
            destination = %destination.display(),
            "栅格化完成"
        );

        Ok(RunSummary {
            grid,
            fragments,
            covered_cells,
        })
    }
}

/// 网格面图层的编号字段名
///
/// 默认为[CELL_ID_FIELD]；输入图层已有同名字段时依次尝试`cell_id_1`、`cell_id_2`……
/// 相交结果里两个图层的字段必须互不重名，否则输入图层的字段会被改名。
fn grid_id_field<S>(service: &S, input: &DatasetId) -> Result<String>
where
    S: GeometryRasterService + ?Sized,
{
    let mut name = CELL_ID_FIELD.to_owned();
    let mut suffix = 0;
    while service.field_kind(input, &name)?.is_some() {
        suffix += 1;
        name = format!("{CELL_ID_FIELD}_{suffix}");
    }
    if suffix > 0 {
        debug!(field = %name, "输入图层已有像元编号字段，改用新字段名");
    }
    Ok(name)
}
