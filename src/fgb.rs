use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    fs::File,
    io::BufReader,
    path::Path,
};

use flatgeobuf::{ColumnType, FallibleStreamingIterator, FgbReader};
use geo::{Geometry, MultiPolygon};
use geozero::{FeatureProperties, ToGeo};
use tracing::debug;

use crate::{Feature, FieldKind, FieldValue, Layer, RasterizeError, Result};

/// 从FlatGeobuf文件读取面图层
///
/// 只接受`Polygon`、`MultiPolygon`（以及可以转换为多边形的`Rect`、`Triangle`）。
/// 字段类型取自文件头中的列定义，属性文本按所在列的类型解析。
pub fn read_flatgeobuf(path: &Path) -> Result<Layer> {
    let file = File::open(path).map_err(read_error(path))?;
    let mut reader = BufReader::new(file);
    let reader = FgbReader::open(&mut reader).map_err(read_error(path))?;
    let schema: BTreeMap<String, FieldKind> = reader
        .header()
        .columns()
        .map(|columns| {
            columns
                .iter()
                .map(|column| (column.name().to_owned(), column_kind(column.type_())))
                .collect()
        })
        .unwrap_or_default();
    let mut features = reader.select_all().map_err(read_error(path))?;

    let mut layer = schema_layer(&schema);
    while let Some(feature) = features.next().map_err(read_error(path))? {
        let geometry = into_multipolygon(feature.to_geo().map_err(read_error(path))?)?;
        let properties = feature.properties().map_err(read_error(path))?;
        layer.push(typed_feature(geometry, &schema, properties).map_err(read_error(path))?);
    }
    debug!(
        path = %path.display(),
        features = layer.len(),
        fields = schema.len(),
        "输入图层已读取"
    );
    Ok(layer)
}

fn read_error<E: Display>(path: &Path) -> impl Fn(E) -> RasterizeError + '_ {
    move |err| RasterizeError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// FlatGeobuf列类型对应的字段类型，布尔列按0/1处理
pub(crate) fn column_kind(column_type: ColumnType) -> FieldKind {
    match column_type {
        ColumnType::Byte
        | ColumnType::UByte
        | ColumnType::Bool
        | ColumnType::Short
        | ColumnType::UShort
        | ColumnType::Int
        | ColumnType::UInt
        | ColumnType::Long
        | ColumnType::ULong => FieldKind::Integer,
        ColumnType::Float | ColumnType::Double => FieldKind::Float,
        _ => FieldKind::Text,
    }
}

/// 按列定义登记所有字段的空图层
pub(crate) fn schema_layer(schema: &BTreeMap<String, FieldKind>) -> Layer {
    let mut layer = Layer::new();
    for (name, kind) in schema {
        layer.declare_field(name.as_str(), *kind);
    }
    layer
}

/// 由几何和属性文本构造要素，不在列定义中的属性按文本处理
pub(crate) fn typed_feature(
    geometry: MultiPolygon<f64>,
    schema: &BTreeMap<String, FieldKind>,
    properties: HashMap<String, String>,
) -> std::result::Result<Feature, String> {
    properties
        .into_iter()
        .try_fold(Feature::new(geometry), |record, (name, text)| {
            let kind = schema.get(&name).copied().unwrap_or(FieldKind::Text);
            let value = typed_value(kind, &text)
                .ok_or_else(|| format!("字段 {name} 的值 {text:?} 不是{kind:?}类型"))?;
            Ok(record.with(name, value))
        })
}

/// 按字段类型解析属性文本，无法解析时返回`None`
pub(crate) fn typed_value(kind: FieldKind, text: &str) -> Option<FieldValue> {
    match kind {
        FieldKind::Text => Some(FieldValue::from(text)),
        _ if text.is_empty() => Some(FieldValue::Null),
        FieldKind::Integer => match text {
            "true" => Some(FieldValue::Integer(1)),
            "false" => Some(FieldValue::Integer(0)),
            // 超出i64的ULong按浮点保存
            _ => text
                .parse::<i64>()
                .map(FieldValue::Integer)
                .or_else(|_| text.parse::<u64>().map(|value| FieldValue::Float(value as f64)))
                .ok(),
        },
        FieldKind::Float => text.parse::<f64>().map(FieldValue::Float).ok(),
    }
}

fn into_multipolygon(geometry: Geometry<f64>) -> Result<MultiPolygon<f64>> {
    let kind = match geometry {
        Geometry::Polygon(polygon) => return Ok(polygon.into()),
        Geometry::MultiPolygon(polygons) => return Ok(polygons),
        Geometry::Rect(rect) => return Ok(rect.to_polygon().into()),
        Geometry::Triangle(triangle) => return Ok(triangle.to_polygon().into()),
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::GeometryCollection(_) => "GeometryCollection",
    };
    Err(RasterizeError::UnsupportedGeometry(kind.to_owned()))
}
