//! Biblioteca de transformaciones.
//!
//! Cada operador es una función pura DataFrame -> DataFrame. Los errores de
//! usuario no fatales (reglas vacías, entradas sobrantes) no fallan: se
//! devuelven como avisos para el log de la ejecución.

pub mod aggregate;
pub mod cast;
pub mod filter;
pub mod join;
pub mod map;
pub mod reshape;
pub mod rows;
pub mod select;
pub mod stats;
pub mod text;
pub mod window;

use serde_json::{Map, Value};

use crate::config::parse_config;
use crate::error::{EtlError, Result};
use crate::frame::DataFrame;

pub use aggregate::AggregateSpec;
pub use cast::CastSpec;
pub use filter::FilterSpec;
pub use join::{suggest_join_pairs, JoinSpec};
pub use map::MapSpec;
pub use reshape::{PivotSpec, UnpivotSpec};
pub use rows::{DropNullsSpec, ExplodeSpec, FillNullsSpec, LimitSpec, SortSpec, UniqueSpec};
pub use select::apply_post;
pub use stats::{BinningSpec, OutliersSpec};
pub use text::{DateTransformSpec, TextTransformSpec};
pub use window::{RollingSpec, WindowSpec};

#[derive(Debug, Clone)]
pub enum TransformOp {
    /// Sólo aplica el post-paso de selección y renombrado.
    Select,
    Filter(FilterSpec),
    Join(JoinSpec),
    Aggregate(AggregateSpec),
    Map(MapSpec),
    Cast(CastSpec),
    Sort(SortSpec),
    Unique(UniqueSpec),
    Limit(LimitSpec),
    FillNulls(FillNullsSpec),
    DropNulls(DropNullsSpec),
    Window(WindowSpec),
    Pivot(PivotSpec),
    Unpivot(UnpivotSpec),
    Explode(ExplodeSpec),
    TextTransform(TextTransformSpec),
    DateTransform(DateTransformSpec),
    Rolling(RollingSpec),
    Binning(BinningSpec),
    Outliers(OutliersSpec),
}

impl TransformOp {
    /// `Ok(None)` si el subtipo no existe.
    pub fn parse(subtype: &str, config: &Map<String, Value>) -> Result<Option<TransformOp>> {
        let op = match subtype {
            "select" | "columns" => TransformOp::Select,
            "filter" => TransformOp::Filter(parse_config(config)?),
            "join" => TransformOp::Join(parse_config(config)?),
            "aggregate" | "group_by" | "groupby" => TransformOp::Aggregate(parse_config(config)?),
            "map" | "compute" => TransformOp::Map(parse_config(config)?),
            "cast" => TransformOp::Cast(parse_config::<CastSpec>(config)?.validated()?),
            "sort" => TransformOp::Sort(parse_config(config)?),
            "unique" | "distinct" => TransformOp::Unique(parse_config(config)?),
            "limit" => TransformOp::Limit(parse_config(config)?),
            "fill_nulls" | "fillna" => TransformOp::FillNulls(parse_config::<FillNullsSpec>(config)?.validated()?),
            "drop_nulls" | "dropna" => TransformOp::DropNulls(parse_config(config)?),
            "window" => TransformOp::Window(parse_config::<WindowSpec>(config)?.validated()?),
            "pivot" => TransformOp::Pivot(parse_config(config)?),
            "unpivot" | "melt" => TransformOp::Unpivot(parse_config(config)?),
            "explode" => TransformOp::Explode(parse_config(config)?),
            "text_transform" | "text" => TransformOp::TextTransform(parse_config(config)?),
            "date_transform" | "date" => {
                TransformOp::DateTransform(parse_config::<DateTransformSpec>(config)?.validated()?)
            },
            "rolling" => TransformOp::Rolling(parse_config::<RollingSpec>(config)?.validated()?),
            "binning" | "bin" => TransformOp::Binning(parse_config::<BinningSpec>(config)?.validated()?),
            "outliers" => TransformOp::Outliers(parse_config(config)?),
            _ => return Ok(None),
        };
        Ok(Some(op))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformOp::Select => "select",
            TransformOp::Filter(_) => "filter",
            TransformOp::Join(_) => "join",
            TransformOp::Aggregate(_) => "aggregate",
            TransformOp::Map(_) => "map",
            TransformOp::Cast(_) => "cast",
            TransformOp::Sort(_) => "sort",
            TransformOp::Unique(_) => "unique",
            TransformOp::Limit(_) => "limit",
            TransformOp::FillNulls(_) => "fill_nulls",
            TransformOp::DropNulls(_) => "drop_nulls",
            TransformOp::Window(_) => "window",
            TransformOp::Pivot(_) => "pivot",
            TransformOp::Unpivot(_) => "unpivot",
            TransformOp::Explode(_) => "explode",
            TransformOp::TextTransform(_) => "text_transform",
            TransformOp::DateTransform(_) => "date_transform",
            TransformOp::Rolling(_) => "rolling",
            TransformOp::Binning(_) => "binning",
            TransformOp::Outliers(_) => "outliers",
        }
    }

    /// Aridad declarada: join y aggregate admiten dos entradas.
    pub fn input_arity(&self) -> usize {
        match self {
            TransformOp::Join(_) | TransformOp::Aggregate(_) => 2,
            _ => 1,
        }
    }

    /// Aplica el operador. `inputs` viene en orden de llegada de aristas;
    /// los avisos no fatales se acumulan en `warnings`.
    pub fn apply(&self, inputs: &[&DataFrame], warnings: &mut Vec<String>) -> Result<DataFrame> {
        let Some(primary) = inputs.first().copied() else {
            return Err(EtlError::transform(format!("{} sin entrada", self.name())));
        };

        match self {
            TransformOp::Select => Ok(primary.clone()),
            TransformOp::Filter(spec) => spec.apply(primary, warnings),
            TransformOp::Join(spec) => {
                let secondary = inputs
                    .get(1)
                    .copied()
                    .ok_or_else(|| EtlError::transform("join requiere dos entradas (left y right)"))?;
                spec.apply(primary, secondary, warnings)
            }
            TransformOp::Aggregate(spec) => {
                if inputs.len() > 1 {
                    warnings.push("aggregate: se ignora la segunda entrada".to_string());
                }
                spec.apply(primary, warnings)
            }
            TransformOp::Map(spec) => spec.apply(primary, warnings),
            TransformOp::Cast(spec) => spec.apply(primary),
            TransformOp::Sort(spec) => spec.apply(primary, warnings),
            TransformOp::Unique(spec) => spec.apply(primary),
            TransformOp::Limit(spec) => Ok(spec.apply(primary)),
            TransformOp::FillNulls(spec) => spec.apply(primary),
            TransformOp::DropNulls(spec) => spec.apply(primary),
            TransformOp::Window(spec) => spec.apply(primary),
            TransformOp::Pivot(spec) => spec.apply(primary),
            TransformOp::Unpivot(spec) => spec.apply(primary),
            TransformOp::Explode(spec) => spec.apply(primary),
            TransformOp::TextTransform(spec) => spec.apply(primary),
            TransformOp::DateTransform(spec) => spec.apply(primary),
            TransformOp::Rolling(spec) => spec.apply(primary),
            TransformOp::Binning(spec) => spec.apply(primary),
            TransformOp::Outliers(spec) => spec.apply(primary),
        }
    }
}
