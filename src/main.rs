//! 面积加权栅格化命令行工具
//!
//! 读取FlatGeobuf面图层，按指定字段做面积加权栅格化，输出ESRI ASCII grid。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use geo_area_rasterize::{read_flatgeobuf, AreaWeightedBuilder, GeoService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "geo-area-rasterize", version)]
#[command(about = "将面图层转换为面积加权栅格")]
struct Args {
    /// 输入面图层（FlatGeobuf）
    input: PathBuf,

    /// 参与加权的数值字段
    field: String,

    /// 像元大小，单位与输入图层坐标一致
    #[arg(allow_negative_numbers = true)]
    cell_size: f64,

    /// 输出栅格路径（ESRI ASCII grid）
    output: PathBuf,

    /// 未被覆盖的像元写入的NoData值
    #[arg(long, default_value_t = -9999.0, allow_negative_numbers = true)]
    nodata: f64,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();

    let layer = read_flatgeobuf(&args.input)
        .with_context(|| format!("无法读取输入图层 {}", args.input.display()))?;
    info!(features = layer.len(), "已读取输入图层");

    let service = GeoService::new();
    let name = args
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("input");
    let input = service.insert_layer(name, layer);

    let rasterizer = AreaWeightedBuilder::field(&args.field)
        .cell_size(args.cell_size)
        .nodata(args.nodata)
        .build()?;
    let summary = rasterizer
        .rasterize(&service, &input, &args.output)
        .with_context(|| format!("栅格化 {} 失败", args.input.display()))?;

    info!(
        width = summary.grid.width(),
        height = summary.grid.height(),
        covered_cells = summary.covered_cells,
        output = %args.output.display(),
        "完成"
    );
    Ok(())
}
