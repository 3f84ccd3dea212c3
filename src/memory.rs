use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use geo::{Area, BooleanOps, BoundingRect, Intersects, MultiPolygon, Polygon, Rect};
use itertools::iproduct;
use tracing::debug;

use crate::{
    write_ascii_grid, DatasetId, Extent, FieldKind, Fragment, FragmentCursor,
    GeometryRasterService, GridSpec, RasterCells, RasterizeError, Result, Stage,
};

/// 属性值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Null,
}

impl FieldValue {
    /// 值的字段类型，空值没有类型
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Integer(_) => Some(FieldKind::Integer),
            FieldValue::Float(_) => Some(FieldKind::Float),
            FieldValue::Text(_) => Some(FieldKind::Text),
            FieldValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) | FieldValue::Null => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// 面要素：几何与属性表
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: BTreeMap<String, FieldValue>,
}

impl Feature {
    pub fn new(geometry: impl Into<MultiPolygon<f64>>) -> Self {
        Feature {
            geometry: geometry.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// 设置一个属性，支持链式调用
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.attributes.get(name)
    }
}

/// 面图层
///
/// 字段类型由写入的非空值推断：整数与浮点混合时视为浮点，
/// 出现文本则视为文本。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layer {
    fields: BTreeMap<String, FieldKind>,
    features: Vec<Feature>,
}

impl Layer {
    pub fn new() -> Self {
        Layer::default()
    }

    pub fn push(&mut self, feature: Feature) {
        for (name, value) in &feature.attributes {
            self.declare(name, value.kind());
        }
        self.features.push(feature);
    }

    /// 按已知的类型登记字段，覆盖之前推断的类型
    ///
    /// 之后写入的值仍参与类型合并：文本字段始终是文本字段。
    pub fn declare_field(&mut self, name: impl Into<String>, kind: FieldKind) {
        self.fields.insert(name.into(), kind);
    }

    /// 声明字段，`kind`为`None`时只登记字段名
    fn declare(&mut self, name: &str, kind: Option<FieldKind>) {
        let merged = match (self.fields.get(name).copied(), kind) {
            (None, None) => None,
            (Some(existing), None) => Some(existing),
            (None, Some(kind)) => Some(kind),
            (Some(existing), Some(kind)) if existing == kind => Some(kind),
            (Some(FieldKind::Text), Some(_)) | (Some(_), Some(FieldKind::Text)) => {
                Some(FieldKind::Text)
            }
            (Some(_), Some(_)) => Some(FieldKind::Float),
        };
        match merged {
            Some(kind) => {
                self.fields.insert(name.to_owned(), kind);
            }
            None => {
                self.fields.entry(name.to_owned()).or_insert(FieldKind::Float);
            }
        }
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// 所有要素包围盒的并，没有非空几何时返回`None`
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.features
            .iter()
            .filter_map(|feature| feature.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                    (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
                )
            })
    }
}

impl FromIterator<Feature> for Layer {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut layer = Layer::new();
        iter.into_iter().for_each(|feature| layer.push(feature));
        layer
    }
}

#[derive(Debug, Clone)]
struct Raster {
    cells: RasterCells,
    grid: GridSpec,
    nodata: Option<f64>,
}

#[derive(Debug, Clone)]
enum Dataset {
    Layer(Layer),
    Raster(Raster),
}

/// 基于[geo]的内存工作空间，实现[GeometryRasterService]
///
/// 相交使用`BooleanOps`，面积使用`Area::unsigned_area`，栅格保存为ESRI ASCII grid。
/// 临时数据集以`in_memory/<前缀>_<序号>`命名，同一工作空间内多次运行互不冲突。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_area_rasterize::Result<()> {
/// use geo::Rect;
/// use geo_area_rasterize::{Feature, GeoService, GeometryRasterService, Layer};
///
/// let layer: Layer = vec![Feature::new(Rect::new((0., 0.), (4., 2.)).to_polygon())]
///     .into_iter()
///     .collect();
/// let service = GeoService::new();
/// let id = service.insert_layer("parcels", layer);
/// let extent = service.extent(&id)?;
/// assert_eq!((extent.xmax, extent.ymax), (4., 2.));
/// # Ok(())}
/// ```
#[derive(Debug, Default)]
pub struct GeoService {
    datasets: RefCell<BTreeMap<DatasetId, Dataset>>,
    counter: Cell<usize>,
}

impl GeoService {
    pub fn new() -> Self {
        GeoService::default()
    }

    /// 登记一个输入图层，同名图层会被替换
    pub fn insert_layer(&self, name: impl Into<String>, layer: Layer) -> DatasetId {
        let id = DatasetId::new(name);
        self.datasets
            .borrow_mut()
            .insert(id.clone(), Dataset::Layer(layer));
        id
    }

    /// 取出图层的副本
    pub fn layer(&self, id: &DatasetId) -> Option<Layer> {
        match self.datasets.borrow().get(id) {
            Some(Dataset::Layer(layer)) => Some(layer.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.datasets.borrow().contains_key(id)
    }

    /// 工作空间中的数据集数量，包括临时数据集
    pub fn dataset_count(&self) -> usize {
        self.datasets.borrow().len()
    }

    fn scratch_id(&self, prefix: &str) -> DatasetId {
        let serial = self.counter.get() + 1;
        self.counter.set(serial);
        DatasetId::new(format!("in_memory/{prefix}_{serial}"))
    }

    fn store(&self, prefix: &str, dataset: Dataset) -> DatasetId {
        let id = self.scratch_id(prefix);
        self.datasets.borrow_mut().insert(id.clone(), dataset);
        id
    }
}

fn layer_in<'a>(
    datasets: &'a BTreeMap<DatasetId, Dataset>,
    id: &DatasetId,
    stage: Stage,
) -> Result<&'a Layer> {
    match datasets.get(id) {
        Some(Dataset::Layer(layer)) => Ok(layer),
        Some(Dataset::Raster(_)) => Err(RasterizeError::Service {
            stage,
            message: format!("`{id}` 是栅格而不是矢量图层"),
        }),
        None => Err(RasterizeError::LayerNotFound(id.to_string())),
    }
}

fn raster_in<'a>(
    datasets: &'a BTreeMap<DatasetId, Dataset>,
    id: &DatasetId,
    stage: Stage,
) -> Result<&'a Raster> {
    match datasets.get(id) {
        Some(Dataset::Raster(raster)) => Ok(raster),
        Some(Dataset::Layer(_)) => Err(RasterizeError::Service {
            stage,
            message: format!("`{id}` 是矢量图层而不是栅格"),
        }),
        None => Err(RasterizeError::LayerNotFound(id.to_string())),
    }
}

/// 第二个图层中与第一个图层重名的字段加`_1`后缀
fn merged_name(first: &Layer, name: &str) -> String {
    if first.field_kind(name).is_some() {
        format!("{name}_1")
    } else {
        name.to_owned()
    }
}

impl GeometryRasterService for GeoService {
    fn extent(&self, layer: &DatasetId) -> Result<Extent> {
        let datasets = self.datasets.borrow();
        layer_in(&datasets, layer, Stage::Extent)?
            .bounding_rect()
            .map(Extent::from)
            .ok_or_else(|| RasterizeError::EmptyLayer(layer.to_string()))
    }

    fn field_kind(&self, layer: &DatasetId, field: &str) -> Result<Option<FieldKind>> {
        let datasets = self.datasets.borrow();
        Ok(layer_in(&datasets, layer, Stage::FieldLookup)?.field_kind(field))
    }

    fn array_to_raster(
        &self,
        cells: RasterCells,
        grid: &GridSpec,
        nodata: Option<f64>,
    ) -> Result<DatasetId> {
        let expected = (grid.height(), grid.width());
        if cells.dim() != expected {
            return Err(RasterizeError::Service {
                stage: Stage::ArrayToRaster,
                message: format!("数组形状 {:?} 与网格 {:?} 不一致", cells.dim(), expected),
            });
        }
        let id = self.store(
            "raster",
            Dataset::Raster(Raster {
                cells,
                grid: *grid,
                nodata,
            }),
        );
        debug!(dataset = %id, rows = expected.0, cols = expected.1, "栅格已创建");
        Ok(id)
    }

    fn vectorize(&self, raster: &DatasetId, field: &str, simplify: bool) -> Result<DatasetId> {
        if simplify {
            return Err(RasterizeError::Service {
                stage: Stage::Vectorize,
                message: "不支持边界简化".to_owned(),
            });
        }
        let layer = {
            let datasets = self.datasets.borrow();
            let raster = raster_in(&datasets, raster, Stage::Vectorize)?;
            let labels = match &raster.cells {
                RasterCells::Labels(labels) => labels,
                RasterCells::Values(_) => {
                    return Err(RasterizeError::Service {
                        stage: Stage::Vectorize,
                        message: "只能对整数栅格转面".to_owned(),
                    })
                }
            };

            // 同值像元归为一组，相邻的合并成一个面
            let mut groups: BTreeMap<u32, Vec<Polygon<f64>>> = BTreeMap::new();
            for (row, col) in iproduct!(0..raster.grid.height(), 0..raster.grid.width()) {
                groups
                    .entry(labels[[row, col]])
                    .or_default()
                    .push(raster.grid.cell_rect(row, col).to_polygon());
            }

            let mut layer = Layer::new();
            for (value, cells) in groups {
                let regions = if cells.len() == 1 {
                    MultiPolygon::new(cells)
                } else {
                    cells
                        .into_iter()
                        .map(|cell| MultiPolygon::new(vec![cell]))
                        .reduce(|merged, cell| merged.union(&cell))
                        .unwrap_or_else(|| MultiPolygon::new(vec![]))
                };
                for region in regions {
                    layer.push(Feature::new(region).with(field, i64::from(value)));
                }
            }
            layer
        };
        let id = self.store("polygrid", Dataset::Layer(layer));
        debug!(dataset = %id, "栅格转面完成");
        Ok(id)
    }

    fn intersect(&self, first: &DatasetId, second: &DatasetId) -> Result<DatasetId> {
        let output = {
            let datasets = self.datasets.borrow();
            let first = layer_in(&datasets, first, Stage::Intersect)?;
            let second = layer_in(&datasets, second, Stage::Intersect)?;

            let mut output = Layer::new();
            for (name, kind) in &first.fields {
                output.declare(name, Some(*kind));
            }
            for (name, kind) in &second.fields {
                output.declare(&merged_name(first, name), Some(*kind));
            }

            let boxes: Vec<_> = second
                .features()
                .iter()
                .map(|feature| feature.geometry.bounding_rect())
                .collect();
            for a in first.features() {
                let Some(a_box) = a.geometry.bounding_rect() else {
                    continue;
                };
                for (b, b_box) in second.features().iter().zip(&boxes) {
                    if !b_box.map_or(false, |b_box| a_box.intersects(&b_box)) {
                        continue;
                    }
                    let piece = a.geometry.intersection(&b.geometry);
                    if piece.unsigned_area() <= 0. {
                        continue;
                    }
                    let mut fragment = Feature::new(piece);
                    fragment.attributes = a.attributes.clone();
                    for (name, value) in &b.attributes {
                        fragment
                            .attributes
                            .insert(merged_name(first, name), value.clone());
                    }
                    output.push(fragment);
                }
            }
            output
        };
        let count = output.len();
        let id = self.store("intersected", Dataset::Layer(output));
        debug!(dataset = %id, fragments = count, "相交完成");
        Ok(id)
    }

    fn fragments(
        &self,
        layer: &DatasetId,
        id_field: &str,
        value_field: &str,
    ) -> Result<FragmentCursor<'_>> {
        let datasets = self.datasets.borrow();
        let source = layer_in(&datasets, layer, Stage::ReadFragments)?;
        for field in [id_field, value_field] {
            if source.field_kind(field).is_none() {
                return Err(RasterizeError::MissingField {
                    layer: layer.to_string(),
                    field: field.to_owned(),
                });
            }
        }

        let fragments: Vec<Result<Fragment>> = source
            .features()
            .iter()
            .map(|feature| {
                let cell_id = match feature.get(id_field) {
                    Some(FieldValue::Integer(id)) => u64::try_from(*id).ok(),
                    _ => None,
                }
                .ok_or_else(|| RasterizeError::Service {
                    stage: Stage::ReadFragments,
                    message: format!("要素的 `{id_field}` 不是有效的像元编号"),
                })?;
                Ok(Fragment {
                    cell_id,
                    value: feature.get(value_field).and_then(FieldValue::as_f64),
                    area: feature.geometry.unsigned_area(),
                })
            })
            .collect();
        Ok(Box::new(fragments.into_iter()))
    }

    fn save(&self, raster: &DatasetId, destination: &Path) -> Result<()> {
        let datasets = self.datasets.borrow();
        let raster = raster_in(&datasets, raster, Stage::Save)?;
        let io_error = |err: std::io::Error| RasterizeError::Io {
            path: destination.display().to_string(),
            message: err.to_string(),
        };

        let file = File::create(destination).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        let written = match &raster.cells {
            RasterCells::Labels(cells) => {
                write_ascii_grid(&mut writer, cells, &raster.grid, raster.nodata)
            }
            RasterCells::Values(cells) => {
                write_ascii_grid(&mut writer, cells, &raster.grid, raster.nodata)
            }
        }
        .and_then(|()| writer.flush());
        if let Err(err) = written {
            drop(writer);
            // 不留下写了一半的文件
            let _ = fs::remove_file(destination);
            return Err(io_error(err));
        }
        debug!(path = %destination.display(), "栅格已保存");
        Ok(())
    }

    fn delete(&self, dataset: &DatasetId) -> Result<()> {
        self.datasets
            .borrow_mut()
            .remove(dataset)
            .map(|_| ())
            .ok_or_else(|| RasterizeError::LayerNotFound(dataset.to_string()))
    }
}
