use std::{fmt, path::Path};

use ndarray::Array2;
use tracing::{debug, warn};

use crate::{Extent, GridSpec, Result};

/// 外部服务中数据集（矢量图层或栅格）的名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(name: impl Into<String>) -> Self {
        DatasetId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(name: &str) -> Self {
        DatasetId::new(name)
    }
}

/// 属性字段的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float)
    }
}

/// 相交结果中的一个片段：某个网格像元与某个输入多边形的交集
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fragment {
    /// 所在像元的行优先编号（从1开始）
    pub cell_id: u64,
    /// 从输入多边形继承的属性值，空值为`None`
    pub value: Option<f64>,
    /// 片段自身的面积
    pub area: f64,
}

/// 交给栅格构建服务的二维数组
#[derive(Debug, Clone, PartialEq)]
pub enum RasterCells {
    /// 整数编号栅格，只用于转面
    Labels(Array2<u32>),
    /// 浮点值栅格
    Values(Array2<f64>),
}

impl RasterCells {
    /// `(rows, cols)`
    pub fn dim(&self) -> (usize, usize) {
        match self {
            RasterCells::Labels(cells) => cells.dim(),
            RasterCells::Values(cells) => cells.dim(),
        }
    }
}

/// 外部服务调用所处的阶段，用于定位失败位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extent,
    FieldLookup,
    ArrayToRaster,
    Vectorize,
    Intersect,
    ReadFragments,
    Save,
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extent => "范围查询",
            Stage::FieldLookup => "字段查询",
            Stage::ArrayToRaster => "数组转栅格",
            Stage::Vectorize => "栅格转面",
            Stage::Intersect => "相交",
            Stage::ReadFragments => "读取片段",
            Stage::Save => "保存栅格",
            Stage::Delete => "删除数据集",
        };
        f.write_str(name)
    }
}

/// 片段游标
pub type FragmentCursor<'a> = Box<dyn Iterator<Item = Result<Fragment>> + 'a>;

/// 几何与栅格服务
///
/// 面积加权栅格化本身只做编排和加权累加，几何相交、栅格与矢量的互相转换、
/// 要素遍历以及栅格持久化都委托给实现了该特征的外部服务。所有调用都是
/// 同步阻塞的，不支持取消，也不做重试。
///
/// 方法接收`&self`：服务代表一个工作空间句柄，实现方自行管理内部可变性，
/// 这样临时数据集的守卫可以与流水线同时持有服务的引用。
pub trait GeometryRasterService {
    /// 查询图层的包围盒
    fn extent(&self, layer: &DatasetId) -> Result<Extent>;

    /// 查询字段类型，字段不存在时返回`None`
    fn field_kind(&self, layer: &DatasetId, field: &str) -> Result<Option<FieldKind>>;

    /// 用二维数组、网格原点与像元大小构建栅格
    fn array_to_raster(
        &self,
        cells: RasterCells,
        grid: &GridSpec,
        nodata: Option<f64>,
    ) -> Result<DatasetId>;

    /// 栅格转面，像元值写入名为`field`的整数属性
    ///
    /// `simplify`为`false`时边界必须与像元边严格一致。
    fn vectorize(&self, raster: &DatasetId, field: &str, simplify: bool) -> Result<DatasetId>;

    /// 两个面图层的叠加相交，保留双方的属性
    fn intersect(&self, first: &DatasetId, second: &DatasetId) -> Result<DatasetId>;

    /// 遍历图层要素，读取像元编号、属性值与面积
    fn fragments(
        &self,
        layer: &DatasetId,
        id_field: &str,
        value_field: &str,
    ) -> Result<FragmentCursor<'_>>;

    /// 将栅格持久化到`destination`
    fn save(&self, raster: &DatasetId, destination: &Path) -> Result<()>;

    /// 删除数据集
    fn delete(&self, dataset: &DatasetId) -> Result<()>;
}

/// 临时数据集守卫，离开作用域时删除数据集
///
/// 无论流水线是正常返回还是因错误提前退出，守卫都会执行删除；
/// 删除失败只记录日志，不会panic。
pub struct Scratch<'s, S>
where
    S: GeometryRasterService + ?Sized,
{
    service: &'s S,
    id: DatasetId,
}

impl<'s, S> Scratch<'s, S>
where
    S: GeometryRasterService + ?Sized,
{
    pub fn new(service: &'s S, id: DatasetId) -> Self {
        Scratch { service, id }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }
}

impl<S> Drop for Scratch<'_, S>
where
    S: GeometryRasterService + ?Sized,
{
    fn drop(&mut self) {
        match self.service.delete(&self.id) {
            Ok(()) => debug!(dataset = %self.id, "临时数据集已删除"),
            Err(err) => warn!(dataset = %self.id, error = %err, "临时数据集删除失败"),
        }
    }
}

impl<S> fmt::Debug for Scratch<'_, S>
where
    S: GeometryRasterService + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch").field("id", &self.id).finish()
    }
}
